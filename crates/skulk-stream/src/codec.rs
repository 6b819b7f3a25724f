//! Binary layout of row keys, stored values and tag columns.
//!
//! # Row key
//!
//! ```text
//! +----------------+------+------------------------------+
//! | metric (UTF-8) | 0x00 | timestamp (8 bytes, BE, sign |
//! |                |      | bit flipped)                 |
//! +----------------+------+------------------------------+
//! ```
//!
//! Flipping the sign bit makes lexicographic byte order match numeric order
//! for every `i64`, so rows of one metric sort by timestamp.
//!
//! # Values
//!
//! A scalar value is 8 bytes (IEEE-754, big-endian); its timestamp is the key
//! timestamp. A packed value is a run of 16-byte pairs, each an 8-byte
//! big-endian timestamp followed by an 8-byte IEEE-754 float. There are no
//! separators; pair `i` starts at byte `i * PAIR_WIDTH`.

use crate::error::{Result, StreamError};
use crate::point::{DataPoint, Tags, Timestamp};
use crate::store::Key;

/// Separator between the metric name and the timestamp in a row key.
pub const ROW_SEPARATOR: u8 = 0x00;

/// Width of an encoded timestamp.
pub const TIMESTAMP_WIDTH: usize = 8;

/// Width of an encoded float.
pub const VALUE_WIDTH: usize = 8;

/// Stride of one packed (timestamp, value) pair.
pub const PAIR_WIDTH: usize = TIMESTAMP_WIDTH + VALUE_WIDTH;

const SIGN_BIT: u64 = 1 << 63;

/// Encodes the row key for `metric` at `timestamp`.
pub fn encode_row_key(metric: &str, timestamp: Timestamp) -> Vec<u8> {
    let mut row = Vec::with_capacity(metric.len() + 1 + TIMESTAMP_WIDTH);
    row.extend_from_slice(metric.as_bytes());
    row.push(ROW_SEPARATOR);
    row.extend_from_slice(&((timestamp as u64) ^ SIGN_BIT).to_be_bytes());
    row
}

/// Decodes a row key into its metric name and timestamp.
///
/// # Errors
///
/// Returns [`StreamError::MalformedKey`] if the row is too short, the
/// separator is missing, or the metric is not UTF-8.
pub fn decode_row_key(row: &[u8]) -> Result<(String, Timestamp)> {
    if row.len() < 1 + TIMESTAMP_WIDTH {
        return Err(StreamError::MalformedKey(format!(
            "row of {} bytes is shorter than {}",
            row.len(),
            1 + TIMESTAMP_WIDTH
        )));
    }
    let split = row.len() - TIMESTAMP_WIDTH;
    if row[split - 1] != ROW_SEPARATOR {
        return Err(StreamError::MalformedKey(
            "missing separator before timestamp".to_string(),
        ));
    }
    let metric = std::str::from_utf8(&row[..split - 1])
        .map_err(|e| StreamError::MalformedKey(format!("metric is not UTF-8: {}", e)))?;
    let timestamp = (read_u64(&row[split..]) ^ SIGN_BIT) as i64;
    Ok((metric.to_string(), timestamp))
}

/// Encodes a single (timestamp, value) pair.
pub fn encode_value(timestamp: Timestamp, value: f64) -> [u8; PAIR_WIDTH] {
    let mut buf = [0u8; PAIR_WIDTH];
    buf[..TIMESTAMP_WIDTH].copy_from_slice(&timestamp.to_be_bytes());
    buf[TIMESTAMP_WIDTH..].copy_from_slice(&value.to_be_bytes());
    buf
}

/// Encodes a timestamp-sorted run of pairs into one packed value.
pub fn packed_encode(points: &[(Timestamp, f64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * PAIR_WIDTH);
    for &(ts, value) in points {
        out.extend_from_slice(&encode_value(ts, value));
    }
    out
}

/// Decodes a packed value.
///
/// # Errors
///
/// Returns [`StreamError::MalformedValue`] if the length is not a multiple
/// of [`PAIR_WIDTH`].
pub fn decode_packed(bytes: &[u8]) -> Result<Vec<(Timestamp, f64)>> {
    check_packed_len(bytes)?;
    Ok((0..bytes.len() / PAIR_WIDTH)
        .map(|i| pair_at(bytes, i))
        .collect())
}

/// Returns the number of pairs in a packed value.
pub fn packed_len(bytes: &[u8]) -> Result<usize> {
    check_packed_len(bytes)?;
    Ok(bytes.len() / PAIR_WIDTH)
}

/// Reads pair `index` of a packed value whose length was already checked.
pub(crate) fn pair_at(bytes: &[u8], index: usize) -> (Timestamp, f64) {
    let offset = index * PAIR_WIDTH;
    let ts = read_u64(&bytes[offset..offset + TIMESTAMP_WIDTH]) as i64;
    let value = f64::from_bits(read_u64(&bytes[offset + TIMESTAMP_WIDTH..offset + PAIR_WIDTH]));
    (ts, value)
}

fn check_packed_len(bytes: &[u8]) -> Result<()> {
    if bytes.len() % PAIR_WIDTH != 0 {
        return Err(StreamError::MalformedValue(format!(
            "packed length {} is not a multiple of {}",
            bytes.len(),
            PAIR_WIDTH
        )));
    }
    Ok(())
}

/// Encodes a scalar value.
pub fn encode_scalar(value: f64) -> [u8; VALUE_WIDTH] {
    value.to_be_bytes()
}

/// Decodes a scalar value.
pub fn decode_scalar(bytes: &[u8]) -> Result<f64> {
    if bytes.len() != VALUE_WIDTH {
        return Err(StreamError::MalformedValue(format!(
            "scalar value has {} bytes, expected {}",
            bytes.len(),
            VALUE_WIDTH
        )));
    }
    Ok(f64::from_bits(read_u64(bytes)))
}

/// Decodes the pairs held by a stored cell, scalar or packed.
///
/// A scalar cell yields one pair stamped with the key timestamp.
pub fn decode_cell(key: &Key, value: &[u8]) -> Result<Vec<(Timestamp, f64)>> {
    if value.len() == VALUE_WIDTH {
        return Ok(vec![(key.timestamp, decode_scalar(value)?)]);
    }
    decode_packed(value)
}

/// Splits tags into the column family (first tag) and qualifier (the rest).
///
/// Tag keys and values are percent-encoded, so `,` and `=` inside them never
/// read back as separators.
pub fn encode_tags(tags: &Tags) -> (Vec<u8>, Vec<u8>) {
    let mut iter = tags
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)));
    let family = iter.next().unwrap_or_default();
    let qualifier = iter.collect::<Vec<_>>().join(",");
    (family.into_bytes(), qualifier.into_bytes())
}

/// Recovers tags from a column family and qualifier.
///
/// # Errors
///
/// Returns [`StreamError::MalformedKey`] if a column is not UTF-8, a pair has
/// no `=`, or an escape does not decode to UTF-8.
pub fn decode_tags(column_family: &[u8], column_qualifier: &[u8]) -> Result<Tags> {
    let mut tags = Tags::new();
    for part in [column_family, column_qualifier] {
        let text = std::str::from_utf8(part)
            .map_err(|e| StreamError::MalformedKey(format!("tag column is not UTF-8: {}", e)))?;
        for pair in text.split(',').filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| StreamError::MalformedKey(format!("tag without '=': {}", pair)))?;
            tags.insert(unescape_tag(k)?, unescape_tag(v)?);
        }
    }
    Ok(tags)
}

fn unescape_tag(text: &str) -> Result<String> {
    urlencoding::decode(text)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| StreamError::MalformedKey(format!("bad tag escape in {}: {}", text, e)))
}

/// Encodes a datapoint as it is stored by the write path.
pub fn encode_point(point: &DataPoint) -> (Key, Vec<u8>) {
    let (family, qualifier) = encode_tags(&point.tags);
    let key = Key::new(
        encode_row_key(&point.metric, point.timestamp),
        family,
        qualifier,
        Vec::new(),
        point.timestamp,
    );
    (key, encode_scalar(point.value).to_vec())
}

/// Parses a scalar cell into a datapoint.
pub fn parse_point(key: &Key, value: &[u8]) -> Result<DataPoint> {
    let (metric, timestamp) = decode_row_key(&key.row)?;
    Ok(DataPoint {
        metric,
        timestamp,
        value: decode_scalar(value)?,
        tags: decode_tags(&key.column_family, &key.column_qualifier)?,
    })
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_roundtrip() {
        for ts in [0, 1, 1_700_000_000_000, -1, i64::MIN, i64::MAX] {
            let row = encode_row_key("sys.cpu.user", ts);
            assert_eq!(row.len(), "sys.cpu.user".len() + 9);
            assert_eq!(decode_row_key(&row).unwrap(), ("sys.cpu.user".to_string(), ts));
        }
    }

    #[test]
    fn test_row_key_order_matches_timestamp_order() {
        let timestamps = [i64::MIN, -5_000, -1, 0, 1, 255, 256, 1_700_000_000_000, i64::MAX];
        for pair in timestamps.windows(2) {
            let a = encode_row_key("m", pair[0]);
            let b = encode_row_key("m", pair[1]);
            assert!(a < b, "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_decode_row_key_malformed() {
        assert!(matches!(decode_row_key(b"short"), Err(StreamError::MalformedKey(_))));

        let mut row = encode_row_key("m", 10);
        row[1] = 0x01;
        assert!(matches!(decode_row_key(&row), Err(StreamError::MalformedKey(_))));

        let mut row = vec![0xff, ROW_SEPARATOR];
        row.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_row_key(&row), Err(StreamError::MalformedKey(_))));
    }

    #[test]
    fn test_packed_layout_is_fixed_stride() {
        let packed = packed_encode(&[(1, 1.5), (2, -2.0)]);
        assert_eq!(packed.len(), 2 * PAIR_WIDTH);
        assert_eq!(&packed[..8], &1i64.to_be_bytes());
        assert_eq!(&packed[8..16], &1.5f64.to_be_bytes());
        assert_eq!(&packed[16..24], &2i64.to_be_bytes());
        assert_eq!(decode_packed(&packed).unwrap(), vec![(1, 1.5), (2, -2.0)]);
    }

    #[test]
    fn test_decode_packed_rejects_partial_pair() {
        let mut packed = packed_encode(&[(1, 1.0)]);
        packed.push(0);
        assert!(matches!(decode_packed(&packed), Err(StreamError::MalformedValue(_))));
        assert!(decode_packed(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_cell_scalar_uses_key_timestamp() {
        let key = Key::new(encode_row_key("m", 42), Vec::new(), Vec::new(), Vec::new(), 42);
        let pairs = decode_cell(&key, &encode_scalar(7.25)).unwrap();
        assert_eq!(pairs, vec![(42, 7.25)]);
    }

    #[test]
    fn test_point_roundtrip() {
        let point = DataPoint::new("sys.cpu.user", [("host", "r01n01"), ("rack", "r01")], 1000, 3.5);
        let (key, value) = encode_point(&point);
        assert_eq!(key.column_family, b"host=r01n01".to_vec());
        assert_eq!(key.column_qualifier, b"rack=r01".to_vec());
        assert_eq!(parse_point(&key, &value).unwrap(), point);
    }

    #[test]
    fn test_point_without_tags() {
        let point = DataPoint::new("m", Vec::<(String, String)>::new(), 5, 1.0);
        let (key, value) = encode_point(&point);
        assert!(key.column_family.is_empty());
        assert!(key.column_qualifier.is_empty());
        assert_eq!(parse_point(&key, &value).unwrap(), point);
    }

    #[test]
    fn test_tags_with_separators_roundtrip() {
        let point = DataPoint::new("m", [("host", "a,b=c"), ("k=1", "50%")], 5, 1.0);
        let (key, value) = encode_point(&point);
        assert_eq!(key.column_family, b"host=a%2Cb%3Dc".to_vec());
        assert_eq!(key.column_qualifier, b"k%3D1=50%25".to_vec());
        let parsed = parse_point(&key, &value).unwrap();
        assert_eq!(parsed.tags, point.tags);
        assert_eq!(parsed.tags.len(), 2);
    }

    #[test]
    fn test_decode_tags_rejects_bad_escape() {
        assert!(matches!(
            decode_tags(b"host=%FF", b""),
            Err(StreamError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_decode_tags_rejects_missing_equals() {
        assert!(matches!(
            decode_tags(b"host", b""),
            Err(StreamError::MalformedKey(_))
        ));
    }
}
