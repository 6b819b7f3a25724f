//! Outbound response objects and the channel they are written to.

use crate::error::{Result, StreamError};
use crate::point::{DataPoint, Tags, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// One element of an outbound message.
///
/// Serialized as either
/// `{"subscriptionId", "metric", "timestamp", "value", "tags"}` or
/// `{"subscriptionId", "complete": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricResponse {
    /// A datapoint delivered to the subscriber.
    #[serde(rename_all = "camelCase")]
    Point {
        /// Subscription the point belongs to.
        subscription_id: String,
        /// Metric name.
        metric: String,
        /// Timestamp in milliseconds.
        timestamp: Timestamp,
        /// Measured value.
        value: f64,
        /// Series tags.
        tags: Tags,
    },
    /// Marks the end of a bounded query.
    #[serde(rename_all = "camelCase")]
    Complete {
        /// Subscription that completed.
        subscription_id: String,
        /// Always `true`.
        complete: bool,
    },
}

impl MetricResponse {
    /// Wraps a datapoint for `subscription_id`.
    pub fn from_point(subscription_id: impl Into<String>, point: DataPoint) -> Self {
        MetricResponse::Point {
            subscription_id: subscription_id.into(),
            metric: point.metric,
            timestamp: point.timestamp,
            value: point.value,
            tags: point.tags,
        }
    }

    /// Creates the completion marker for `subscription_id`.
    pub fn completion(subscription_id: impl Into<String>) -> Self {
        MetricResponse::Complete {
            subscription_id: subscription_id.into(),
            complete: true,
        }
    }

    /// Returns the subscription id carried by the response.
    pub fn subscription_id(&self) -> &str {
        match self {
            MetricResponse::Point {
                subscription_id, ..
            }
            | MetricResponse::Complete {
                subscription_id, ..
            } => subscription_id,
        }
    }

    /// Returns true for a completion marker.
    pub fn is_completion(&self) -> bool {
        matches!(self, MetricResponse::Complete { complete: true, .. })
    }
}

/// Serializes a batch of responses into one outbound text message.
pub trait ResponseEncoder: Send + Sync {
    /// Encodes `batch`, preserving order.
    fn encode(&self, batch: &[MetricResponse]) -> Result<String>;
}

/// Encodes a batch as a JSON array.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl ResponseEncoder for JsonEncoder {
    fn encode(&self, batch: &[MetricResponse]) -> Result<String> {
        serde_json::to_string(batch).map_err(|e| StreamError::SerializationFailure(e.to_string()))
    }
}

/// The persistent connection messages are written to.
pub trait OutboundChannel: Send + Sync {
    /// Sends one text message.
    fn send(&self, message: String) -> Result<()>;
}

impl OutboundChannel for UnboundedSender<String> {
    fn send(&self, message: String) -> Result<()> {
        UnboundedSender::send(self, message).map_err(|_| StreamError::ChannelClosed)
    }
}
