//! Time-windowed compaction and expansion of stored datapoints.
//!
//! # Architecture
//!
//! ```text
//! store cursor → WindowCompactor → packed records   (maintenance time)
//! store cursor → WindowExpander  → scalar records   (read time)
//! ```
//!
//! Both transforms are [`KvCursor`](crate::store::KvCursor)s wrapping another
//! cursor, so they can be stacked over any sorted source and re-seeked at any
//! position.

pub mod compactor;
pub mod expander;

use crate::error::{Result, StreamError};
use crate::point::Timestamp;
use std::collections::HashMap;
use std::time::Duration;

pub use compactor::{merge_fragments, CompactionStats, WindowCompactor};
pub use expander::{expand, expand_cell, Expansion, PointMerge, WindowExpander};

/// Option key that disables windowing when set to `true`.
pub const ALL_OPTION: &str = "all";

/// Option key holding the window size duration string.
pub const WINDOW_SIZE_OPTION: &str = "window_size";

/// Default window size: 1 day.
pub const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(24 * 60 * 60);

/// The equivalence class used to decide which records may merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    /// Windowing disabled: every record of a series merges.
    All,
    /// Fixed-size windows aligned to the epoch.
    Fixed(Duration),
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow::Fixed(DEFAULT_WINDOW_SIZE)
    }
}

impl TimeWindow {
    /// Creates a fixed window.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidWindow`] for windows shorter than 1ms.
    pub fn fixed(size: Duration) -> Result<Self> {
        if size.as_millis() == 0 {
            return Err(StreamError::InvalidWindow(
                "window size must be at least 1ms".to_string(),
            ));
        }
        Ok(TimeWindow::Fixed(size))
    }

    /// Returns the window index of `timestamp`: `floor(timestamp / size)`,
    /// or 0 for [`TimeWindow::All`].
    pub fn window_index(&self, timestamp: Timestamp) -> i64 {
        match self {
            TimeWindow::All => 0,
            TimeWindow::Fixed(size) => {
                let size_ms = i64::try_from(size.as_millis()).unwrap_or(i64::MAX).max(1);
                timestamp.div_euclid(size_ms)
            }
        }
    }

    /// Parses transform registration options.
    ///
    /// `all=true` wins over any window size. Without either option the
    /// default window applies.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut options = HashMap::new();
    /// options.insert("window_size".to_string(), "6h".to_string());
    /// assert_eq!(
    ///     TimeWindow::from_options(&options)?,
    ///     TimeWindow::Fixed(Duration::from_secs(6 * 3600)),
    /// );
    /// ```
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        if let Some(all) = options.get(ALL_OPTION) {
            match all.trim().to_ascii_lowercase().as_str() {
                "true" => return Ok(TimeWindow::All),
                "false" => {}
                other => {
                    return Err(StreamError::InvalidWindow(format!(
                        "{} must be true or false, got {}",
                        ALL_OPTION, other
                    )))
                }
            }
        }
        match options.get(WINDOW_SIZE_OPTION) {
            Some(size) => TimeWindow::fixed(parse_duration(size)?),
            None => Ok(TimeWindow::default()),
        }
    }
}

/// Parses a duration such as `500ms`, `30s`, `15m`, `6h` or `1d`.
/// A bare number is milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| StreamError::InvalidWindow(format!("invalid duration: {:?}", text)))?;
    let millis = match unit.to_ascii_lowercase().as_str() {
        "" | "ms" => Some(amount),
        "s" => amount.checked_mul(1_000),
        "m" => amount.checked_mul(60_000),
        "h" => amount.checked_mul(3_600_000),
        "d" => amount.checked_mul(86_400_000),
        _ => {
            return Err(StreamError::InvalidWindow(format!(
                "unknown duration unit {:?} in {:?}",
                unit, text
            )))
        }
    };
    millis
        .map(Duration::from_millis)
        .ok_or_else(|| StreamError::InvalidWindow(format!("duration overflows: {:?}", text)))
}

/// Configuration for [`WindowCompactor`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactorConfig {
    /// Window used to group records.
    pub window: TimeWindow,
    /// Closes a group once it holds this many points, bounding memory.
    pub max_group_points: Option<usize>,
}

impl CompactorConfig {
    /// Creates a configuration for the given window without a group cap.
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            max_group_points: None,
        }
    }

    /// Builds a configuration from transform registration options.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        Ok(Self::new(TimeWindow::from_options(options)?))
    }

    /// Sets the maximum number of points per output record.
    pub fn with_max_group_points(mut self, max: usize) -> Self {
        self.max_group_points = Some(max.max(1));
        self
    }
}
