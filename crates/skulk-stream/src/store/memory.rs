//! In-memory sorted store.
//!
//! [`MemoryStore`] keeps `(Key, value)` pairs in a shared `BTreeMap` and
//! serves [`RangeScanner`]s through the same cursor stack a remote store
//! would run server-side:
//!
//! ```text
//! MemoryCursor → [WindowExpander | WindowCompactor] → tag filter → read-ahead buffer
//! ```

use crate::codec;
use crate::error::Result;
use crate::point::{DataPoint, Tags};
use crate::store::{DataStore, Key, KvCursor, RangeScanner, ScanRange, ScanRequest};
use crate::window::{CompactionStats, CompactorConfig, WindowCompactor, WindowExpander};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::debug;

type Table = BTreeMap<Key, Vec<u8>>;

/// Transform applied to every scan, mirroring an iterator registered on a
/// table's read path.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReadTransform {
    /// Return records as stored.
    #[default]
    None,
    /// Expand packed records into one scalar record per point.
    Expand,
    /// Merge records of one series and window into packed records.
    Compact(CompactorConfig),
}

/// A shared, thread-safe sorted map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    table: Arc<RwLock<Table>>,
    transform: ReadTransform,
}

impl MemoryStore {
    /// Creates an empty store without a read transform.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transform applied to scans.
    pub fn with_transform(mut self, transform: ReadTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Returns the registered read transform.
    pub fn transform(&self) -> &ReadTransform {
        &self.transform
    }

    /// Inserts or replaces a record.
    pub fn put(&self, key: Key, value: Vec<u8>) {
        let mut table = self.table.write().unwrap_or_else(|err| err.into_inner());
        table.insert(key, value);
    }

    /// Stores a datapoint as a scalar record.
    pub fn put_point(&self, point: &DataPoint) {
        let (key, value) = codec::encode_point(point);
        self.put(key, value);
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(|err| err.into_inner()).len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of every stored record in key order.
    pub fn entries(&self) -> Vec<(Key, Vec<u8>)> {
        let table = self.table.read().unwrap_or_else(|err| err.into_inner());
        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Returns a raw cursor over the stored records.
    pub fn cursor(&self) -> MemoryCursor {
        MemoryCursor::new(Arc::clone(&self.table))
    }

    /// Opens the cursor stack for the registered transform.
    fn open_cursor(&self) -> Box<dyn KvCursor + Send> {
        match &self.transform {
            ReadTransform::None => Box::new(self.cursor()),
            ReadTransform::Expand => Box::new(WindowExpander::new(self.cursor())),
            ReadTransform::Compact(config) => {
                Box::new(WindowCompactor::new(self.cursor(), config.clone()))
            }
        }
    }

    /// Rewrites the stored records through a [`WindowCompactor`].
    ///
    /// The merge runs over a snapshot without blocking writers. Records
    /// added meanwhile are kept as they are; if a snapshot record was
    /// overwritten or removed meanwhile, the table is compacted again under
    /// the write lock.
    pub fn compact(&self, config: &CompactorConfig) -> Result<CompactionStats> {
        let snapshot = self.entries();
        let (output, stats) = run_compactor(snapshot.clone(), config)?;

        let mut table = self.table.write().unwrap_or_else(|err| err.into_inner());
        let stats = install(&mut table, snapshot, output, stats, config)?;
        debug!(
            "Compacted {} records into {} ({} points merged)",
            stats.records_read, stats.groups_emitted, stats.points_merged
        );
        Ok(stats)
    }
}

fn run_compactor(
    entries: Vec<(Key, Vec<u8>)>,
    config: &CompactorConfig,
) -> Result<(Vec<(Key, Vec<u8>)>, CompactionStats)> {
    let mut compactor = WindowCompactor::new(MemoryCursor::from_entries(entries), config.clone());
    compactor.seek(&ScanRange::all())?;
    let mut output = Vec::new();
    while let Some(pair) = compactor.next()? {
        output.push(pair);
    }
    Ok((output, compactor.stats()))
}

/// Swaps the records of `snapshot` for their compacted `output`.
fn install(
    table: &mut Table,
    snapshot: Vec<(Key, Vec<u8>)>,
    output: Vec<(Key, Vec<u8>)>,
    stats: CompactionStats,
    config: &CompactorConfig,
) -> Result<CompactionStats> {
    let changed = snapshot
        .iter()
        .any(|(key, value)| table.get(key) != Some(value));
    if changed {
        debug!("Records changed during compaction, compacting again under the write lock");
        let current = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let (output, stats) = run_compactor(current, config)?;
        table.clear();
        table.extend(output);
        return Ok(stats);
    }
    for (key, _) in &snapshot {
        table.remove(key);
    }
    table.extend(output);
    Ok(stats)
}

impl DataStore for MemoryStore {
    fn create_scanner_for_metric(&self, request: &ScanRequest) -> Result<Box<dyn RangeScanner>> {
        debug!(
            "Creating scanner for {} (session {}, tags {:?})",
            request.metric, request.session_id, request.tags
        );
        Ok(Box::new(MemoryScanner::new(self.clone(), request)))
    }
}

/// A [`KvCursor`] over a snapshot of the records in the seek range.
#[derive(Debug)]
pub struct MemoryCursor {
    table: Arc<RwLock<Table>>,
    buffer: VecDeque<(Key, Vec<u8>)>,
}

impl MemoryCursor {
    fn new(table: Arc<RwLock<Table>>) -> Self {
        Self {
            table,
            buffer: VecDeque::new(),
        }
    }

    /// Builds a standalone cursor over the given records.
    pub fn from_entries(entries: impl IntoIterator<Item = (Key, Vec<u8>)>) -> Self {
        Self::new(Arc::new(RwLock::new(entries.into_iter().collect())))
    }
}

impl KvCursor for MemoryCursor {
    fn seek(&mut self, range: &ScanRange) -> Result<()> {
        let table = self.table.read().unwrap_or_else(|err| err.into_inner());
        let entries: Box<dyn Iterator<Item = (&Key, &Vec<u8>)>> = match &range.start {
            Some(start) => {
                // Smallest key of the start row.
                let lower = Key {
                    row: start.row.clone(),
                    timestamp: i64::MAX,
                    ..Key::default()
                };
                Box::new(table.range(lower..))
            }
            None => Box::new(table.iter()),
        };
        self.buffer = entries
            .skip_while(|(k, _)| range.before_start(&k.row))
            .take_while(|(k, _)| !range.after_end(&k.row))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn peek_key(&self) -> Option<&Key> {
        self.buffer.front().map(|(key, _)| key)
    }

    fn next(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        Ok(self.buffer.pop_front())
    }
}

/// The [`RangeScanner`] handed out by [`MemoryStore`].
///
/// Records are fetched from the cursor stack `batch_size * read_ahead` at a
/// time and filtered by the request's tags.
pub struct MemoryScanner {
    store: MemoryStore,
    range: ScanRange,
    tags: Tags,
    fetch_size: usize,
    cursor: Option<Box<dyn KvCursor + Send>>,
    buffer: VecDeque<(Key, Vec<u8>)>,
    exhausted: bool,
}

impl MemoryScanner {
    /// Creates a scanner for `request` over `store`.
    pub fn new(store: MemoryStore, request: &ScanRequest) -> Self {
        Self {
            store,
            range: request.range.clone(),
            tags: request.tags.clone(),
            fetch_size: request.batch_size.max(1) * request.read_ahead.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn reset(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fetch(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            let mut cursor = self.store.open_cursor();
            cursor.seek(&self.range)?;
            self.cursor = Some(cursor);
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(());
        };
        while self.buffer.len() < self.fetch_size {
            match cursor.next()? {
                Some((key, value)) => {
                    if matches_filter(&self.tags, &key)? {
                        self.buffer.push_back((key, value));
                    }
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(())
    }
}

fn matches_filter(filter: &Tags, key: &Key) -> Result<bool> {
    if filter.is_empty() {
        return Ok(true);
    }
    let tags = codec::decode_tags(&key.column_family, &key.column_qualifier)?;
    Ok(filter.iter().all(|(k, v)| tags.get(k) == Some(v)))
}

#[async_trait]
impl RangeScanner for MemoryScanner {
    fn range(&self) -> &ScanRange {
        &self.range
    }

    fn set_range(&mut self, range: ScanRange) {
        self.range = range;
        self.reset();
    }

    async fn next_entry(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch()?;
        }
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::TimeWindow;
    use std::time::Duration;

    fn point(ts: i64, host: &str) -> DataPoint {
        DataPoint::new("sys.cpu.user", [("host", host)], ts, ts as f64)
    }

    fn request(store_tags: Tags, start: i64, end: i64) -> ScanRequest {
        ScanRequest::for_metric(
            "session",
            "sys.cpu.user",
            store_tags,
            start,
            Some(end),
            Duration::ZERO,
            0,
            2,
            1,
        )
    }

    async fn drain(scanner: &mut dyn RangeScanner) -> Vec<DataPoint> {
        let mut points = Vec::new();
        while let Some((key, value)) = scanner.next_entry().await.unwrap() {
            points.push(codec::parse_point(&key, &value).unwrap());
        }
        points
    }

    #[test]
    fn test_cursor_seek_respects_bounds() {
        let store = MemoryStore::new();
        for ts in [10, 20, 30, 40] {
            store.put_point(&point(ts, "h1"));
        }
        let mut cursor = store.cursor();
        let range = ScanRange::new(
            codec::encode_row_key("sys.cpu.user", 20),
            false,
            codec::encode_row_key("sys.cpu.user", 40),
            true,
        );
        cursor.seek(&range).unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key.timestamp);
        }
        assert_eq!(seen, vec![30, 40]);
        assert!(!cursor.has_next());
    }

    #[tokio::test]
    async fn test_scanner_filters_tags_and_rereads_after_set_range() {
        let store = MemoryStore::new();
        for ts in 0..6 {
            store.put_point(&point(ts, if ts % 2 == 0 { "h1" } else { "h2" }));
        }

        let mut filter = Tags::new();
        filter.insert("host".to_string(), "h1".to_string());
        let mut scanner = store.create_scanner_for_metric(&request(filter, 0, 10)).unwrap();
        let points = drain(scanner.as_mut()).await;
        let ts: Vec<_> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![0, 2, 4]);

        assert!(scanner.next_entry().await.unwrap().is_none());

        store.put_point(&point(8, "h1"));
        scanner.close();
        let next = ScanRange::new(
            codec::encode_row_key("sys.cpu.user", 4),
            false,
            codec::encode_row_key("sys.cpu.user", 10),
            false,
        );
        scanner.set_range(next);
        let points = drain(scanner.as_mut()).await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, 8);
    }

    #[test]
    fn test_compact_keeps_record_overwritten_during_merge() {
        let config = CompactorConfig::new(TimeWindow::All);
        let mut table = Table::new();
        for ts in 0..3 {
            let (key, value) = codec::encode_point(&point(ts, "h1"));
            table.insert(key, value);
        }
        let snapshot: Vec<_> = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let (output, stats) = run_compactor(snapshot.clone(), &config).unwrap();

        let (late_key, _) = codec::encode_point(&point(1, "h1"));
        table.insert(late_key, codec::encode_scalar(99.0).to_vec());
        let (new_key, new_value) = codec::encode_point(&point(5, "h2"));
        table.insert(new_key, new_value);

        install(&mut table, snapshot, output, stats, &config).unwrap();
        let pairs: Vec<_> = table
            .iter()
            .map(|(k, v)| codec::decode_cell(k, v).unwrap())
            .collect();
        assert_eq!(pairs, vec![vec![(0, 0.0), (1, 99.0), (2, 2.0)], vec![(5, 5.0)]]);
    }

    #[test]
    fn test_compact_keeps_records_added_during_merge() {
        let config = CompactorConfig::new(TimeWindow::All);
        let mut table = Table::new();
        for ts in 0..3 {
            let (key, value) = codec::encode_point(&point(ts, "h1"));
            table.insert(key, value);
        }
        let snapshot: Vec<_> = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let (output, stats) = run_compactor(snapshot.clone(), &config).unwrap();

        let (new_key, new_value) = codec::encode_point(&point(7, "h1"));
        table.insert(new_key.clone(), new_value.clone());

        let stats = install(&mut table, snapshot, output, stats, &config).unwrap();
        assert_eq!(stats.records_read, 3);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&new_key), Some(&new_value));
    }

    #[tokio::test]
    async fn test_compacted_store_reads_through_expander() {
        let store = MemoryStore::new();
        for ts in 0..50 {
            store.put_point(&point(ts * 1000, "h1"));
        }
        let stats = store
            .compact(&CompactorConfig::new(TimeWindow::All))
            .unwrap();
        assert_eq!(stats.records_read, 50);
        assert_eq!(store.len(), 1);

        let reader = store.clone().with_transform(ReadTransform::Expand);
        let mut scanner = reader
            .create_scanner_for_metric(&request(Tags::new(), 0, 100_000))
            .unwrap();
        let points = drain(scanner.as_mut()).await;
        assert_eq!(points.len(), 50);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(points[49], point(49_000, "h1"));
    }
}
