//! Live subscription scanning.
//!
//! # Architecture
//!
//! ```text
//! Subscription ──add_metric──► ScanSession (one tokio task per metric)
//!                                  │
//!                 RangeScanner ────┤ next_entry / set_range / close
//!                                  ▼
//!                            FlushScheduler ◄── FlushTimer (periodic)
//!                                  │
//!                                  ▼
//!                           OutboundChannel
//! ```
//!
//! A session tails open-ended queries forever by re-ranging its scanner to
//! `now - lag` after each exhausted pass, and ends bounded queries with a
//! single completion marker. Whatever the exit path, the scanner is closed
//! and the owning [`Subscription`] notified exactly once.

pub mod flush;
pub mod owner;
pub mod response;
pub mod session;

use std::time::Duration;

pub use flush::{FlushOutcome, FlushScheduler, FlushStats, FlushTimer, OutboundBatch};
pub use owner::{Subscription, SubscriptionOwner};
pub use response::{JsonEncoder, MetricResponse, OutboundChannel, ResponseEncoder};
pub use session::{
    Clock, ExitReason, MetricQuery, ScanCursor, ScanHandle, ScanSession, ScanState, SystemClock,
};

/// Default number of entries fetched per store round trip.
pub const DEFAULT_SCANNER_BATCH_SIZE: usize = 5000;

/// Default number of batches fetched ahead.
pub const DEFAULT_SCANNER_READ_AHEAD: usize = 1;

/// Default period of timer-driven flushes (1 second).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of pending responses that triggers an inline flush.
pub const DEFAULT_SUBSCRIPTION_BATCH_SIZE: usize = 1000;

/// Default pause between passes of a tailing scan (1 second).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default distance kept between the tail and the wall clock (2 minutes).
pub const DEFAULT_LAG: Duration = Duration::from_secs(120);

/// Tuning of scan sessions.
///
/// # Examples
/// ```rust,ignore
/// use alopex_skulk_stream::subscription::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::default()
///     .with_lag(Duration::from_secs(30))
///     .with_subscription_batch_size(500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Entries fetched per store round trip.
    pub scanner_batch_size: usize,
    /// Batches fetched ahead of the reader.
    pub scanner_read_ahead: usize,
    /// Period of timer-driven flushes.
    pub flush_interval: Duration,
    /// Pending responses that trigger an inline flush.
    pub subscription_batch_size: usize,
    /// Pause before each re-issued scan of a tailing query.
    pub retry_delay: Duration,
    /// Safety margin subtracted from the wall clock when tailing.
    pub lag: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scanner_batch_size: DEFAULT_SCANNER_BATCH_SIZE,
            scanner_read_ahead: DEFAULT_SCANNER_READ_AHEAD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            subscription_batch_size: DEFAULT_SUBSCRIPTION_BATCH_SIZE,
            retry_delay: DEFAULT_RETRY_DELAY,
            lag: DEFAULT_LAG,
        }
    }
}

impl SessionConfig {
    /// Sets the store batch size.
    pub fn with_scanner_batch_size(mut self, size: usize) -> Self {
        self.scanner_batch_size = size;
        self
    }

    /// Sets the store read-ahead.
    pub fn with_scanner_read_ahead(mut self, batches: usize) -> Self {
        self.scanner_read_ahead = batches;
        self
    }

    /// Sets the flush period.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the inline flush threshold.
    pub fn with_subscription_batch_size(mut self, size: usize) -> Self {
        self.subscription_batch_size = size;
        self
    }

    /// Sets the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the lag.
    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.scanner_batch_size, 5000);
        assert_eq!(config.scanner_read_ahead, 1);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.subscription_batch_size, 1000);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.lag, Duration::from_secs(120));
    }

    #[test]
    fn test_session_config_builders() {
        let config = SessionConfig::default()
            .with_scanner_batch_size(10)
            .with_scanner_read_ahead(3)
            .with_flush_interval(Duration::from_millis(250))
            .with_subscription_batch_size(2)
            .with_retry_delay(Duration::from_millis(50))
            .with_lag(Duration::ZERO);
        assert_eq!(config.scanner_batch_size, 10);
        assert_eq!(config.scanner_read_ahead, 3);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.subscription_batch_size, 2);
        assert_eq!(config.retry_delay, Duration::from_millis(50));
        assert_eq!(config.lag, Duration::ZERO);
    }
}
