//! Store collaborator interfaces.
//!
//! The live-query core never talks to a concrete key-value store. It consumes
//! two seams:
//!
//! - [`KvCursor`]: a restartable, pull-based cursor over ascending
//!   `(Key, value)` pairs. The in-memory source, the [`WindowCompactor`] and
//!   the [`WindowExpander`] all implement it so they can be stacked.
//! - [`RangeScanner`]: the store-side range scan a subscription session owns.
//!   It reports and accepts its current [`ScanRange`] so the session can
//!   re-range it while tailing.
//!
//! [`WindowCompactor`]: crate::window::WindowCompactor
//! [`WindowExpander`]: crate::window::WindowExpander

pub mod memory;

use crate::codec;
use crate::error::Result;
use crate::point::{Tags, Timestamp};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

pub use memory::{MemoryCursor, MemoryScanner, MemoryStore, ReadTransform};

/// A stored key.
///
/// Keys sort by row, column family, column qualifier and visibility in
/// ascending byte order, then by timestamp descending (newest first).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    /// Row bytes: `metric 0x00 timestamp`.
    pub row: Vec<u8>,
    /// Column family: the first tag as `k=v`.
    pub column_family: Vec<u8>,
    /// Column qualifier: the remaining tags as `k=v,k=v`.
    pub column_qualifier: Vec<u8>,
    /// Visibility label.
    pub visibility: Vec<u8>,
    /// Cell timestamp in milliseconds.
    pub timestamp: Timestamp,
}

impl Key {
    /// Creates a key from its parts.
    pub fn new(
        row: impl Into<Vec<u8>>,
        column_family: impl Into<Vec<u8>>,
        column_qualifier: impl Into<Vec<u8>>,
        visibility: impl Into<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            row: row.into(),
            column_family: column_family.into(),
            column_qualifier: column_qualifier.into(),
            visibility: visibility.into(),
            timestamp,
        }
    }

    /// Returns true if both keys address the same column (everything but
    /// row and timestamp is equal).
    pub fn same_column(&self, other: &Key) -> bool {
        self.column_family == other.column_family
            && self.column_qualifier == other.column_qualifier
            && self.visibility == other.visibility
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column_family.cmp(&other.column_family))
            .then_with(|| self.column_qualifier.cmp(&other.column_qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match codec::decode_row_key(&self.row) {
            Ok((metric, ts)) => write!(f, "{}@{}", metric, ts)?,
            Err(_) => write!(f, "{:?}", self.row)?,
        }
        write!(
            f,
            " {}:{} [{}] {}",
            String::from_utf8_lossy(&self.column_family),
            String::from_utf8_lossy(&self.column_qualifier),
            String::from_utf8_lossy(&self.visibility),
            self.timestamp
        )
    }
}

/// One end of a row range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBound {
    /// Boundary row.
    pub row: Vec<u8>,
    /// Whether rows equal to `row` are inside the range.
    pub inclusive: bool,
}

impl RangeBound {
    /// Creates a new bound.
    pub fn new(row: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        Self {
            row: row.into(),
            inclusive,
        }
    }
}

/// A row range. A missing bound is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanRange {
    /// Lower bound.
    pub start: Option<RangeBound>,
    /// Upper bound.
    pub end: Option<RangeBound>,
}

impl ScanRange {
    /// Returns a range covering every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Creates a range bounded on both sides.
    pub fn new(
        start_row: impl Into<Vec<u8>>,
        start_inclusive: bool,
        end_row: impl Into<Vec<u8>>,
        end_inclusive: bool,
    ) -> Self {
        Self {
            start: Some(RangeBound::new(start_row, start_inclusive)),
            end: Some(RangeBound::new(end_row, end_inclusive)),
        }
    }

    /// Returns true if the start bound is inclusive (or absent).
    pub fn is_start_inclusive(&self) -> bool {
        self.start.as_ref().map_or(true, |b| b.inclusive)
    }

    /// Returns true if the end bound is inclusive (or absent).
    pub fn is_end_inclusive(&self) -> bool {
        self.end.as_ref().map_or(true, |b| b.inclusive)
    }

    /// Returns true if `row` sorts before the start of this range.
    pub fn before_start(&self, row: &[u8]) -> bool {
        match &self.start {
            None => false,
            Some(b) if b.inclusive => row < b.row.as_slice(),
            Some(b) => row <= b.row.as_slice(),
        }
    }

    /// Returns true if `row` sorts after the end of this range.
    pub fn after_end(&self, row: &[u8]) -> bool {
        match &self.end {
            None => false,
            Some(b) if b.inclusive => row > b.row.as_slice(),
            Some(b) => row >= b.row.as_slice(),
        }
    }

    /// Returns true if `row` lies inside the range.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        !self.before_start(row) && !self.after_end(row)
    }
}

/// A restartable, pull-based cursor over ascending `(Key, value)` pairs.
///
/// After [`seek`](KvCursor::seek) the cursor is positioned on the first pair
/// inside the range. `peek_key` never advances; `next` returns the current
/// pair and advances.
pub trait KvCursor {
    /// Positions the cursor at the start of `range`, discarding any state.
    fn seek(&mut self, range: &ScanRange) -> Result<()>;

    /// Returns true if another pair is available.
    fn has_next(&self) -> bool;

    /// Returns the key of the next pair without consuming it.
    fn peek_key(&self) -> Option<&Key>;

    /// Returns the next pair and advances, or `None` when exhausted.
    fn next(&mut self) -> Result<Option<(Key, Vec<u8>)>>;
}

impl<C: KvCursor + ?Sized> KvCursor for Box<C> {
    fn seek(&mut self, range: &ScanRange) -> Result<()> {
        (**self).seek(range)
    }

    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    fn peek_key(&self) -> Option<&Key> {
        (**self).peek_key()
    }

    fn next(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        (**self).next()
    }
}

/// The store-side range scan owned by exactly one scan session.
///
/// `close` releases the current read (buffers, server-side sessions); the
/// scanner may be re-ranged with `set_range` and read again afterwards.
#[async_trait]
pub trait RangeScanner: Send {
    /// Returns the range the scanner is currently set to.
    fn range(&self) -> &ScanRange;

    /// Replaces the scan range. The next read starts from its beginning.
    fn set_range(&mut self, range: ScanRange);

    /// Returns the next pair in range, or `None` when the range is exhausted.
    async fn next_entry(&mut self) -> Result<Option<(Key, Vec<u8>)>>;

    /// Releases resources held by the current read.
    fn close(&mut self);
}

/// Parameters for opening a scanner over one metric.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Identity of the client session, used for logging only.
    pub session_id: String,
    /// Metric to scan.
    pub metric: String,
    /// Tags every returned point must carry.
    pub tags: Tags,
    /// Initial row range.
    pub range: ScanRange,
    /// Number of entries fetched per store round trip.
    pub batch_size: usize,
    /// Number of batches fetched ahead of the reader.
    pub read_ahead: usize,
}

impl ScanRequest {
    /// Builds the request for a metric query.
    ///
    /// The range starts inclusively at `start_time` and ends exclusively at
    /// `end_time`, or at `now - lag` for an open-ended query.
    #[allow(clippy::too_many_arguments)]
    pub fn for_metric(
        session_id: impl Into<String>,
        metric: impl Into<String>,
        tags: Tags,
        start_time: Timestamp,
        end_time: Option<Timestamp>,
        lag: Duration,
        now: Timestamp,
        batch_size: usize,
        read_ahead: usize,
    ) -> Self {
        let metric = metric.into();
        let end = end_time.unwrap_or_else(|| tail_boundary(now, lag));
        let range = ScanRange::new(
            codec::encode_row_key(&metric, start_time),
            true,
            codec::encode_row_key(&metric, end),
            false,
        );
        Self {
            session_id: session_id.into(),
            metric,
            tags,
            range,
            batch_size,
            read_ahead,
        }
    }
}

/// Returns `now - lag` in milliseconds.
pub fn tail_boundary(now: Timestamp, lag: Duration) -> Timestamp {
    now.saturating_sub(i64::try_from(lag.as_millis()).unwrap_or(i64::MAX))
}

/// Factory for store-side scanners.
pub trait DataStore: Send + Sync {
    /// Opens a scanner for the request's metric, tags and range.
    fn create_scanner_for_metric(&self, request: &ScanRequest) -> Result<Box<dyn RangeScanner>>;
}
