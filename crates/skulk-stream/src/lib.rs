//! Skulk Stream - live metric subscriptions and windowed compaction
//!
//! This crate provides the live-query core of the Alopex Skulk time series
//! database on top of a sorted, range-scannable key-value store.
//!
//! # Components
//!
//! - [`codec`]: Row key, packed value and tag column layouts
//! - [`WindowCompactor`] / [`WindowExpander`]: Merge records of one series and
//!   time window into packed records, and split them back at read time
//! - [`ScanSession`]: Streams one metric to a subscriber, tailing open-ended
//!   queries and completing bounded ones
//! - [`FlushScheduler`]: Size- and time-triggered batching of outbound responses
//! - [`MemoryStore`]: In-memory [`DataStore`] implementation
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_skulk_stream::{DataPoint, MemoryStore, ReadTransform, SessionConfig, Subscription};
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new().with_transform(ReadTransform::Expand);
//! store.put_point(&DataPoint::new("sys.cpu.user", [("host", "r01n01")], now_ms, 0.75));
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
//! let subscription = Subscription::new("sub-1", "client-1", Arc::new(store), Arc::new(tx),
//!     SessionConfig::default());
//!
//! // Tail the metric from an hour ago
//! subscription.add_metric("sys.cpu.user", Default::default(), now_ms - 3_600_000, None)?;
//! while let Some(json) = rx.recv().await {
//!     println!("{}", json);
//! }
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod error;
pub mod point;
pub mod store;
pub mod subscription;
pub mod window;

pub use error::{Result, StreamError};
pub use point::{DataPoint, Tags, Timestamp};
pub use store::{
    DataStore, Key, KvCursor, MemoryStore, RangeScanner, ReadTransform, ScanRange, ScanRequest,
};
pub use subscription::{
    ExitReason, FlushScheduler, MetricQuery, MetricResponse, OutboundChannel, ScanHandle,
    ScanSession, SessionConfig, Subscription, SubscriptionOwner,
};
pub use window::{CompactorConfig, TimeWindow, WindowCompactor, WindowExpander};
