//! Expands packed records back into individual datapoints.
//!
//! Compacted records are kept per series, so the points of several series in
//! one window sit in separate records. Readers that want one timestamp-ordered
//! stream feed those records through a [`PointMerge`]:
//!
//! ```text
//! record h1@10 [10, 30] ─┐
//!                        ├─► PointMerge ─► 10 (h1), 20 (h2), 30 (h1)
//! record h2@20 [20]     ─┘
//! ```

use crate::codec;
use crate::error::{Result, StreamError};
use crate::point::{DataPoint, Tags, Timestamp};
use crate::store::{Key, KvCursor, ScanRange};
use crate::window::compactor::Head;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A lazy, restartable sequence of the datapoints held by one packed value.
///
/// Points are produced in the order they are stored, which is ascending
/// timestamp order for any record written by the compactor.
#[derive(Debug, Clone)]
pub struct Expansion {
    metric: String,
    tags: Tags,
    packed: Vec<u8>,
    len: usize,
    position: usize,
}

impl Expansion {
    /// Rewinds to the first point.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Returns the total number of points in the record.
    pub fn total(&self) -> usize {
        self.len
    }

    /// Returns the metric every point carries.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Returns the timestamp of the next point without consuming it.
    pub fn peek_timestamp(&self) -> Option<Timestamp> {
        (self.position < self.len).then(|| codec::pair_at(&self.packed, self.position).0)
    }
}

impl Iterator for Expansion {
    type Item = DataPoint;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.len {
            return None;
        }
        let (timestamp, value) = codec::pair_at(&self.packed, self.position);
        self.position += 1;
        Some(DataPoint {
            metric: self.metric.clone(),
            timestamp,
            value,
            tags: self.tags.clone(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Expansion {}

/// Expands a packed value into datapoints carrying `metric` and `tags`.
///
/// An empty value yields an empty sequence.
///
/// # Errors
///
/// Returns [`StreamError::MalformedValue`](crate::error::StreamError::MalformedValue)
/// if the value is not a whole number of pairs.
pub fn expand(metric: impl Into<String>, tags: Tags, packed: Vec<u8>) -> Result<Expansion> {
    let len = codec::packed_len(&packed)?;
    Ok(Expansion {
        metric: metric.into(),
        tags,
        packed,
        len,
        position: 0,
    })
}

/// Expands a stored cell, scalar or packed, using its key for the metric,
/// tags and (for scalars) the timestamp.
pub fn expand_cell(key: &Key, value: &[u8]) -> Result<Expansion> {
    let (metric, _) = codec::decode_row_key(&key.row)?;
    let tags = codec::decode_tags(&key.column_family, &key.column_qualifier)?;
    expand(metric, tags, cell_pairs(key, value.to_vec())?)
}

/// Returns the packed pairs of a cell, widening a scalar to one pair.
fn cell_pairs(key: &Key, value: Vec<u8>) -> Result<Vec<u8>> {
    if value.len() == codec::VALUE_WIDTH {
        return Ok(codec::encode_value(key.timestamp, codec::decode_scalar(&value)?).to_vec());
    }
    codec::packed_len(&value)?;
    Ok(value)
}

/// Streaming merge of timestamp-sorted point runs.
///
/// Runs must be pushed in store order, which within one metric is ascending
/// order of their first timestamp. A popped point is final only if no run
/// still to be pushed starts before it; callers check that against the next
/// record with [`peek`](Self::peek). Equal timestamps come out in push order.
#[derive(Debug, Default)]
pub struct PointMerge {
    runs: Vec<(Key, Expansion)>,
    heap: BinaryHeap<Reverse<Head>>,
}

impl PointMerge {
    /// Creates an empty merge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the points of the record stored under `key`.
    pub fn push(&mut self, key: Key, expansion: Expansion) {
        if self.heap.is_empty() {
            self.runs.clear();
        }
        let Some(ts) = expansion.peek_timestamp() else {
            return;
        };
        self.heap.push(Reverse(Head {
            ts,
            fragment: self.runs.len(),
            position: expansion.position,
        }));
        self.runs.push((key, expansion));
    }

    /// Returns the metric and timestamp of the next point.
    pub fn peek(&self) -> Option<(&str, Timestamp)> {
        self.heap
            .peek()
            .map(|Reverse(head)| (self.runs[head.fragment].1.metric(), head.ts))
    }

    /// Returns the timestamp of the next point.
    pub fn peek_timestamp(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(head)| head.ts)
    }

    /// Removes the next point, returning it with the key of its record.
    pub fn pop(&mut self) -> Option<(&Key, DataPoint)> {
        let Reverse(head) = self.heap.pop()?;
        let (key, expansion) = &mut self.runs[head.fragment];
        let point = expansion.next()?;
        if let Some(ts) = expansion.peek_timestamp() {
            self.heap.push(Reverse(Head {
                ts,
                fragment: head.fragment,
                position: expansion.position,
            }));
        }
        Some((&*key, point))
    }

    /// Returns true if no points are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops every pending point.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.runs.clear();
    }
}

/// The read-time inverse of [`WindowCompactor`](crate::window::WindowCompactor).
///
/// Every source record is split into one scalar record per point. The row
/// and timestamp of each output key are those of the point; column family,
/// qualifier and visibility are copied from the source key. Records of one
/// metric whose spans overlap are merged, so points come out in timestamp
/// order across series. Points whose row falls outside the seek range are
/// dropped.
pub struct WindowExpander<C> {
    source: C,
    range: ScanRange,
    merge: PointMerge,
    top: Option<(Key, Vec<u8>)>,
    deferred: Option<StreamError>,
}

impl<C: KvCursor> WindowExpander<C> {
    /// Wraps `source`. Call [`seek`](KvCursor::seek) before reading.
    pub fn new(source: C) -> Self {
        Self {
            source,
            range: ScanRange::all(),
            merge: PointMerge::new(),
            top: None,
            deferred: None,
        }
    }

    /// Consumes the expander, returning its source.
    pub fn into_inner(self) -> C {
        self.source
    }

    /// Returns true if the next source record may hold a point at or before
    /// the merge head.
    fn source_overlaps(&self) -> Result<bool> {
        let Some(next) = self.source.peek_key() else {
            return Ok(false);
        };
        let Some((metric, head_ts)) = self.merge.peek() else {
            return Ok(true);
        };
        let (next_metric, first_ts) = codec::decode_row_key(&next.row)?;
        Ok(next_metric == metric && first_ts <= head_ts)
    }

    fn advance(&mut self) -> Result<()> {
        self.top = None;
        loop {
            while self.source_overlaps()? {
                let Some((key, value)) = self.source.next()? else {
                    break;
                };
                let (metric, _) = codec::decode_row_key(&key.row)?;
                let packed = cell_pairs(&key, value)?;
                self.merge.push(key, expand(metric, Tags::new(), packed)?);
            }

            let Some((source_key, point)) = self.merge.pop() else {
                return Ok(());
            };
            let row = codec::encode_row_key(&point.metric, point.timestamp);
            if !self.range.contains_row(&row) {
                continue;
            }
            let point_key = Key {
                row,
                column_family: source_key.column_family.clone(),
                column_qualifier: source_key.column_qualifier.clone(),
                visibility: source_key.visibility.clone(),
                timestamp: point.timestamp,
            };
            self.top = Some((point_key, codec::encode_scalar(point.value).to_vec()));
            return Ok(());
        }
    }
}

impl<C: KvCursor> KvCursor for WindowExpander<C> {
    fn seek(&mut self, range: &ScanRange) -> Result<()> {
        self.range = range.clone();
        self.merge.clear();
        self.deferred = None;
        self.source.seek(range)?;
        self.advance()
    }

    fn has_next(&self) -> bool {
        self.top.is_some() || self.deferred.is_some()
    }

    fn peek_key(&self) -> Option<&Key> {
        self.top.as_ref().map(|(key, _)| key)
    }

    fn next(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let out = self.top.take();
        if out.is_some() {
            if let Err(err) = self.advance() {
                self.deferred = Some(err);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCursor;

    fn tags() -> Tags {
        let mut tags = Tags::new();
        tags.insert("host".to_string(), "r01n01".to_string());
        tags
    }

    #[test]
    fn test_expand_yields_points_in_order() {
        let packed = codec::packed_encode(&[(1000, 1.0), (2000, 2.0), (3000, 3.0)]);
        let points: Vec<_> = expand("sys.cpu.user", tags(), packed).unwrap().collect();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], DataPoint::new("sys.cpu.user", [("host", "r01n01")], 1000, 1.0));
        assert_eq!(points[2].timestamp, 3000);
        assert!(points.iter().all(|p| p.tags == tags()));
    }

    #[test]
    fn test_expand_empty_value() {
        let mut expansion = expand("m", Tags::new(), Vec::new()).unwrap();
        assert_eq!(expansion.total(), 0);
        assert!(expansion.next().is_none());
    }

    #[test]
    fn test_expand_rejects_partial_pair() {
        assert!(matches!(
            expand("m", Tags::new(), vec![0u8; 17]),
            Err(StreamError::MalformedValue(_))
        ));
    }

    #[test]
    fn test_expansion_restart() {
        let packed = codec::packed_encode(&[(1, 1.0), (2, 2.0)]);
        let mut expansion = expand("m", Tags::new(), packed).unwrap();
        assert_eq!(expansion.len(), 2);
        let first: Vec<_> = expansion.by_ref().collect();
        assert_eq!(expansion.len(), 0);
        expansion.restart();
        let second: Vec<_> = expansion.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_expand_cell_scalar() {
        let point = DataPoint::new("m", [("host", "r01n01")], 77, 4.5);
        let (key, value) = codec::encode_point(&point);
        let points: Vec<_> = expand_cell(&key, &value).unwrap().collect();
        assert_eq!(points, vec![point]);
    }

    #[test]
    fn test_point_merge_orders_overlapping_runs() {
        let key_for = |host: &str, ts| {
            Key::new(
                codec::encode_row_key("m", ts),
                format!("host={}", host).into_bytes(),
                Vec::new(),
                Vec::new(),
                ts,
            )
        };
        let mut merge = PointMerge::new();
        let h1 = codec::packed_encode(&[(10, 1.0), (30, 3.0)]);
        let h2 = codec::packed_encode(&[(20, 2.0), (30, 30.0)]);
        merge.push(key_for("h1", 10), expand("m", Tags::new(), h1).unwrap());
        assert_eq!(merge.peek(), Some(("m", 10)));
        merge.push(key_for("h2", 20), expand("m", Tags::new(), h2).unwrap());

        let mut seen = Vec::new();
        while let Some((key, point)) = merge.pop() {
            seen.push((point.timestamp, key.column_family.clone()));
        }
        assert_eq!(
            seen,
            vec![
                (10, b"host=h1".to_vec()),
                (20, b"host=h2".to_vec()),
                (30, b"host=h1".to_vec()),
                (30, b"host=h2".to_vec()),
            ]
        );
        assert!(merge.is_empty());
    }

    #[test]
    fn test_cursor_interleaves_series_by_timestamp() {
        let key_for = |host: &str, ts| {
            Key::new(
                codec::encode_row_key("m", ts),
                format!("host={}", host).into_bytes(),
                Vec::new(),
                Vec::new(),
                ts,
            )
        };
        let entries = vec![
            (key_for("h1", 10), codec::packed_encode(&[(10, 1.0), (30, 3.0)])),
            (key_for("h2", 20), codec::encode_scalar(2.0).to_vec()),
            (key_for("h1", 40), codec::encode_scalar(4.0).to_vec()),
        ];
        let mut expander = WindowExpander::new(MemoryCursor::from_entries(entries));
        expander.seek(&ScanRange::all()).unwrap();

        let mut seen = Vec::new();
        while let Some((key, value)) = expander.next().unwrap() {
            let point = codec::parse_point(&key, &value).unwrap();
            seen.push((point.timestamp, point.tags["host"].clone()));
        }
        let expected: Vec<_> = [(10, "h1"), (20, "h2"), (30, "h1"), (40, "h1")]
            .iter()
            .map(|&(ts, host)| (ts, host.to_string()))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_cursor_expands_and_filters_range() {
        let row_key = |ts| {
            Key::new(
                codec::encode_row_key("m", ts),
                b"host=r01n01".to_vec(),
                Vec::new(),
                Vec::new(),
                ts,
            )
        };
        let entries = vec![
            (row_key(100), codec::packed_encode(&[(100, 1.0), (150, 1.5), (250, 2.5)])),
            (row_key(300), Vec::new()),
            (row_key(400), codec::encode_scalar(4.0).to_vec()),
        ];
        let mut expander = WindowExpander::new(MemoryCursor::from_entries(entries));

        expander.seek(&ScanRange::all()).unwrap();
        let mut seen = Vec::new();
        while let Some((key, value)) = expander.next().unwrap() {
            let point = codec::parse_point(&key, &value).unwrap();
            seen.push((point.timestamp, point.value));
        }
        assert_eq!(seen, vec![(100, 1.0), (150, 1.5), (250, 2.5), (400, 4.0)]);

        let range = ScanRange::new(
            codec::encode_row_key("m", 0),
            true,
            codec::encode_row_key("m", 200),
            false,
        );
        expander.seek(&range).unwrap();
        assert_eq!(expander.peek_key().unwrap().timestamp, 100);
        let mut count = 0;
        while expander.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
