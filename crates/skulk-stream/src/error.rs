//! Error and Result types for Skulk stream operations.

use thiserror::Error;

/// A convenience `Result` type for Skulk stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// The error type for codec, compaction and subscription operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    /// A row key does not have the `metric 0x00 timestamp` layout.
    #[error("Malformed row key: {0}")]
    MalformedKey(String),

    /// A stored value is neither a scalar nor a whole number of packed pairs.
    #[error("Malformed value: {0}")]
    MalformedValue(String),

    /// The underlying store failed during a scan or seek.
    #[error("Store read failure: {0}")]
    StoreReadFailure(String),

    /// An outbound batch could not be encoded.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// The outbound channel no longer accepts messages.
    #[error("Outbound channel closed")]
    ChannelClosed,

    /// A time window option could not be parsed.
    #[error("Invalid time window: {0}")]
    InvalidWindow(String),
}
