//! Merges adjacent records of one series and time window into packed records.
//!
//! The compactor reads its source forward while the next record has the same
//! metric and window index as the first record of the open group. Rows carry
//! only the metric and timestamp, so series of one metric interleave in key
//! order; inside a group records are therefore collected per column (tags,
//! visibility). Each input is already timestamp sorted, so the decoded
//! fragments of a column are combined with an N-way heap merge and encoded
//! once when the group closes. The output key of a column is its first key,
//! and outputs are emitted in first-key order.
//!
//! A column made of a single record is emitted unchanged, byte for byte.
//! Duplicate timestamps across fragments are kept; nothing is resolved here.

use crate::codec;
use crate::error::{Result, StreamError};
use crate::point::Timestamp;
use crate::store::{Key, KvCursor, ScanRange};
use crate::window::CompactorConfig;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use tracing::trace;

/// Counters describing the work done by a compactor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Output records emitted.
    pub groups_emitted: u64,
    /// Input records consumed.
    pub records_read: u64,
    /// Points written into merged (multi-record) outputs.
    pub points_merged: u64,
}

/// Records of one column inside the open group.
struct ColumnGroup {
    first_key: Key,
    /// Kept undecoded until a second record joins.
    first_value: Option<Vec<u8>>,
    fragments: Vec<Vec<(Timestamp, f64)>>,
}

impl ColumnGroup {
    fn new(first_key: Key, first_value: Vec<u8>) -> Self {
        Self {
            first_key,
            first_value: Some(first_value),
            fragments: Vec::new(),
        }
    }

    fn push(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        if let Some(first) = self.first_value.take() {
            self.fragments
                .push(codec::decode_cell(&self.first_key, &first)?);
        }
        self.fragments.push(codec::decode_cell(key, value)?);
        Ok(())
    }

    /// Closes the column, returning its output and the number of merged points.
    fn finish(self) -> (Key, Vec<u8>, usize) {
        match self.first_value {
            Some(untouched) => (self.first_key, untouched, 0),
            None => {
                let merged = merge_fragments(self.fragments);
                let count = merged.len();
                (self.first_key, codec::packed_encode(&merged), count)
            }
        }
    }
}

/// A pull-based merge transform over a sorted source.
///
/// A source error met while reading ahead is held back until the records
/// already merged have been returned.
pub struct WindowCompactor<C> {
    source: C,
    config: CompactorConfig,
    ready: VecDeque<(Key, Vec<u8>)>,
    deferred: Option<StreamError>,
    stats: CompactionStats,
}

impl<C: KvCursor> WindowCompactor<C> {
    /// Wraps `source`. Call [`seek`](KvCursor::seek) before reading.
    pub fn new(source: C, config: CompactorConfig) -> Self {
        Self {
            source,
            config,
            ready: VecDeque::new(),
            deferred: None,
            stats: CompactionStats::default(),
        }
    }

    /// Returns the compactor configuration.
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Returns counters accumulated since creation.
    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    /// Consumes the compactor, returning its source.
    pub fn into_inner(self) -> C {
        self.source
    }

    fn group_of(&self, key: &Key) -> Result<(String, i64)> {
        let (metric, ts) = codec::decode_row_key(&key.row)?;
        Ok((metric, self.config.window.window_index(ts)))
    }

    /// Reads the next group from the source into `ready`.
    fn load_group(&mut self) -> Result<()> {
        let Some((first_key, first_value)) = self.source.next()? else {
            return Ok(());
        };
        self.stats.records_read += 1;

        let group = self.group_of(&first_key)?;
        let mut open_points = cell_len(&first_value)?;
        let mut columns = vec![ColumnGroup::new(first_key, first_value)];

        loop {
            if let Some(max) = self.config.max_group_points {
                if open_points >= max {
                    break;
                }
            }
            let joins = match self.source.peek_key() {
                Some(key) => self.group_of(key)? == group,
                None => false,
            };
            if !joins {
                break;
            }
            let (key, value) = self.source.next()?.ok_or_else(|| {
                StreamError::StoreReadFailure("source lost a peeked record".to_string())
            })?;
            self.stats.records_read += 1;
            open_points += cell_len(&value)?;

            match columns.iter_mut().find(|c| c.first_key.same_column(&key)) {
                Some(column) => column.push(&key, &value)?,
                None => columns.push(ColumnGroup::new(key, value)),
            }
        }

        for column in columns {
            let (key, value, merged) = column.finish();
            if merged > 0 {
                self.stats.points_merged += merged as u64;
                trace!(
                    "Compacted {} points into window {} of {}",
                    merged,
                    group.1,
                    group.0
                );
            }
            self.stats.groups_emitted += 1;
            self.ready.push_back((key, value));
        }
        Ok(())
    }
}

impl<C: KvCursor> KvCursor for WindowCompactor<C> {
    fn seek(&mut self, range: &ScanRange) -> Result<()> {
        self.ready.clear();
        self.deferred = None;
        self.source.seek(range)?;
        self.load_group()
    }

    fn has_next(&self) -> bool {
        !self.ready.is_empty() || self.deferred.is_some()
    }

    fn peek_key(&self) -> Option<&Key> {
        self.ready.front().map(|(key, _)| key)
    }

    fn next(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let out = self.ready.pop_front();
        if out.is_some() && self.ready.is_empty() {
            if let Err(err) = self.load_group() {
                self.deferred = Some(err);
            }
        }
        Ok(out)
    }
}

fn cell_len(value: &[u8]) -> Result<usize> {
    if value.len() == codec::VALUE_WIDTH {
        return Ok(1);
    }
    codec::packed_len(value)
}

/// Heap entry ordered by timestamp, then fragment index so equal timestamps
/// keep their input order.
#[derive(Debug)]
pub(super) struct Head {
    pub(super) ts: Timestamp,
    pub(super) fragment: usize,
    pub(super) position: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.fragment.cmp(&other.fragment))
    }
}

/// Merges individually sorted fragments into one sorted run.
pub fn merge_fragments(fragments: Vec<Vec<(Timestamp, f64)>>) -> Vec<(Timestamp, f64)> {
    let total = fragments.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    let mut heap = BinaryHeap::with_capacity(fragments.len());

    for (fragment, pairs) in fragments.iter().enumerate() {
        if let Some(&(ts, _)) = pairs.first() {
            heap.push(Reverse(Head {
                ts,
                fragment,
                position: 0,
            }));
        }
    }

    while let Some(Reverse(head)) = heap.pop() {
        let pairs = &fragments[head.fragment];
        merged.push(pairs[head.position]);
        let position = head.position + 1;
        if let Some(&(ts, _)) = pairs.get(position) {
            heap.push(Reverse(Head {
                ts,
                fragment: head.fragment,
                position,
            }));
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCursor;
    use crate::window::TimeWindow;
    use std::time::Duration;

    fn key(metric: &str, ts: Timestamp) -> Key {
        Key::new(
            codec::encode_row_key(metric, ts),
            b"host=h1".to_vec(),
            Vec::new(),
            Vec::new(),
            ts,
        )
    }

    fn compact_all(entries: Vec<(Key, Vec<u8>)>, config: CompactorConfig) -> Vec<(Key, Vec<u8>)> {
        let mut compactor = WindowCompactor::new(MemoryCursor::from_entries(entries), config);
        compactor.seek(&ScanRange::all()).unwrap();
        let mut out = Vec::new();
        while let Some(pair) = compactor.next().unwrap() {
            out.push(pair);
        }
        out
    }

    #[test]
    fn test_merge_fragments_interleaved() {
        let merged = merge_fragments(vec![
            vec![(1, 1.0), (4, 4.0), (6, 6.0)],
            vec![(2, 2.0), (3, 3.0)],
            vec![(5, 5.0)],
        ]);
        let ts: Vec<_> = merged.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(ts, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_merge_fragments_keeps_duplicates_in_input_order() {
        let merged = merge_fragments(vec![vec![(1, 1.0), (2, 2.0)], vec![(2, 20.0)]]);
        assert_eq!(merged, vec![(1, 1.0), (2, 2.0), (2, 20.0)]);
    }

    #[test]
    fn test_single_record_passes_through() {
        let value = codec::encode_scalar(3.0).to_vec();
        let out = compact_all(vec![(key("m", 10), value.clone())], CompactorConfig::default());
        assert_eq!(out, vec![(key("m", 10), value)]);
    }

    #[test]
    fn test_windows_split_groups() {
        let window = TimeWindow::fixed(Duration::from_millis(100)).unwrap();
        let entries = [10, 50, 120, 130, 250]
            .iter()
            .map(|&ts| (key("m", ts), codec::encode_scalar(ts as f64).to_vec()))
            .collect();
        let out = compact_all(entries, CompactorConfig::new(window));

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, key("m", 10));
        assert_eq!(codec::decode_packed(&out[0].1).unwrap(), vec![(10, 10.0), (50, 50.0)]);
        assert_eq!(out[1].0, key("m", 120));
        assert_eq!(
            codec::decode_packed(&out[1].1).unwrap(),
            vec![(120, 120.0), (130, 130.0)]
        );
        assert_eq!(out[2].1, codec::encode_scalar(250.0).to_vec());
    }

    #[test]
    fn test_interleaved_columns_merge_per_series() {
        let mut other_host = key("m", 20);
        other_host.column_family = b"host=h2".to_vec();
        let entries = vec![
            (key("a", 10), codec::encode_scalar(1.0).to_vec()),
            (key("m", 10), codec::encode_scalar(2.0).to_vec()),
            (other_host, codec::encode_scalar(3.0).to_vec()),
            (key("m", 30), codec::encode_scalar(4.0).to_vec()),
        ];
        let out = compact_all(entries, CompactorConfig::new(TimeWindow::All));

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, key("a", 10));
        assert_eq!(out[1].0, key("m", 10));
        assert_eq!(codec::decode_packed(&out[1].1).unwrap(), vec![(10, 2.0), (30, 4.0)]);
        assert_eq!(out[2].0.column_family, b"host=h2".to_vec());
        assert_eq!(out[2].1, codec::encode_scalar(3.0).to_vec());
    }

    #[test]
    fn test_max_group_points_caps_output() {
        let entries: Vec<(Key, Vec<u8>)> = (0..10)
            .map(|ts| (key("m", ts), codec::encode_scalar(ts as f64).to_vec()))
            .collect();
        let config = CompactorConfig::new(TimeWindow::All).with_max_group_points(4);
        let mut compactor = WindowCompactor::new(MemoryCursor::from_entries(entries), config);
        compactor.seek(&ScanRange::all()).unwrap();

        let mut sizes = Vec::new();
        while let Some((_, value)) = compactor.next().unwrap() {
            sizes.push(codec::decode_cell(&key("m", 9), &value).unwrap().len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(compactor.stats().records_read, 10);
        assert_eq!(compactor.stats().groups_emitted, 3);
    }

    #[test]
    fn test_read_ahead_error_follows_finished_group() {
        let window = TimeWindow::fixed(Duration::from_millis(100)).unwrap();
        let entries = vec![
            (key("m", 10), codec::encode_scalar(1.0).to_vec()),
            (key("m", 20), codec::encode_scalar(2.0).to_vec()),
            (key("m", 250), vec![0u8; 5]),
        ];
        let mut compactor =
            WindowCompactor::new(MemoryCursor::from_entries(entries), CompactorConfig::new(window));
        compactor.seek(&ScanRange::all()).unwrap();

        let (first_key, first_value) = compactor.next().unwrap().unwrap();
        assert_eq!(first_key, key("m", 10));
        assert_eq!(codec::decode_packed(&first_value).unwrap(), vec![(10, 1.0), (20, 2.0)]);
        assert!(compactor.has_next());
        assert!(matches!(compactor.next(), Err(StreamError::MalformedValue(_))));
        assert!(!compactor.has_next());
    }

    #[test]
    fn test_malformed_value_fails_group() {
        let entries = vec![
            (key("m", 1), codec::encode_scalar(1.0).to_vec()),
            (key("m", 2), vec![0u8; 5]),
        ];
        let mut compactor = WindowCompactor::new(
            MemoryCursor::from_entries(entries),
            CompactorConfig::new(TimeWindow::All),
        );
        let result = compactor.seek(&ScanRange::all());
        assert!(matches!(result, Err(StreamError::MalformedValue(_))));
    }
}
