//! Batching of outbound responses.
//!
//! A [`FlushScheduler`] is shared by one scan session and its periodic timer:
//!
//! ```text
//! scan loop ──append()──┐
//!                       ├──► Mutex<OutboundBatch> ──flush()──► OutboundChannel
//! FlushTimer ──flush()──┘
//! ```
//!
//! Every append and every drain of the batch happens under the same lock, so
//! the two call sites never interleave inside a flush.
//!
//! An encoding failure keeps the batch for the next attempt. A closed channel
//! is final: the batch is dropped and later appends are discarded.

use crate::error::StreamError;
use crate::subscription::response::{MetricResponse, OutboundChannel, ResponseEncoder};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, trace, warn};

/// Pending responses of one session.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    /// Responses in delivery order.
    pub responses: Vec<MetricResponse>,
    /// Set once the completion marker has been appended.
    pub complete: bool,
    /// Set once the channel reported itself closed.
    pub disconnected: bool,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// The given number of responses were sent and cleared.
    Sent(usize),
    /// Sending failed; the given number of responses stay pending.
    Retained(usize),
    /// The channel is closed; the given number of responses were dropped.
    Closed(usize),
}

/// Counters for a [`FlushScheduler`].
#[derive(Debug, Default)]
pub struct FlushStats {
    /// Messages successfully sent.
    pub flushes: AtomicU64,
    /// Responses successfully sent.
    pub responses_sent: AtomicU64,
    /// Flush attempts that failed.
    pub failed_flushes: AtomicU64,
    /// Responses discarded because the channel was closed.
    pub dropped_responses: AtomicU64,
}

impl FlushStats {
    /// Gets the number of messages sent.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Gets the number of responses sent.
    pub fn responses_sent(&self) -> u64 {
        self.responses_sent.load(Ordering::Relaxed)
    }

    /// Gets the number of failed flushes.
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    /// Gets the number of responses dropped after the channel closed.
    pub fn dropped_responses(&self) -> u64 {
        self.dropped_responses.load(Ordering::Relaxed)
    }
}

/// Size- and time-triggered batching in front of an [`OutboundChannel`].
///
/// A batch that fails to encode is logged and kept, then resent with anything
/// appended meanwhile on the next successful flush. Delivery is therefore
/// at-least-once. Once the channel reports [`StreamError::ChannelClosed`] the
/// scheduler is disconnected and stops buffering.
pub struct FlushScheduler {
    name: String,
    threshold: usize,
    batch: Mutex<OutboundBatch>,
    channel: Arc<dyn OutboundChannel>,
    encoder: Arc<dyn ResponseEncoder>,
    stats: FlushStats,
}

impl fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("pending", &self.pending())
            .finish()
    }
}

impl FlushScheduler {
    /// Creates a scheduler that flushes once `threshold` responses are pending.
    ///
    /// `name` identifies the owning session in logs.
    pub fn new(
        name: impl Into<String>,
        threshold: usize,
        channel: Arc<dyn OutboundChannel>,
        encoder: Arc<dyn ResponseEncoder>,
    ) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            batch: Mutex::new(OutboundBatch::default()),
            channel,
            encoder,
            stats: FlushStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboundBatch> {
        self.batch.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Appends a response, flushing inline once the threshold is reached.
    ///
    /// The response is discarded if the scheduler is disconnected.
    pub fn append(&self, response: MetricResponse) {
        let mut batch = self.lock();
        if batch.disconnected {
            self.stats.dropped_responses.fetch_add(1, Ordering::Relaxed);
            return;
        }
        batch.responses.push(response);
        if batch.responses.len() >= self.threshold {
            self.flush_locked(&mut batch);
        }
    }

    /// Appends the completion marker for `subscription_id`.
    ///
    /// Returns false if a marker was already appended or the scheduler is
    /// disconnected; the marker is only ever added once.
    pub fn append_completion(&self, subscription_id: &str) -> bool {
        let mut batch = self.lock();
        if batch.complete || batch.disconnected {
            return false;
        }
        batch
            .responses
            .push(MetricResponse::completion(subscription_id));
        batch.complete = true;
        true
    }

    /// Sends all pending responses as one message. A no-op when empty.
    pub fn flush(&self) -> FlushOutcome {
        let mut batch = self.lock();
        self.flush_locked(&mut batch)
    }

    fn flush_locked(&self, batch: &mut OutboundBatch) -> FlushOutcome {
        let count = batch.responses.len();
        if batch.disconnected {
            return FlushOutcome::Closed(0);
        }
        if count == 0 {
            return FlushOutcome::Empty;
        }
        let sent = self
            .encoder
            .encode(&batch.responses)
            .and_then(|message| self.channel.send(message));
        match sent {
            Ok(()) => {
                batch.responses.clear();
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .responses_sent
                    .fetch_add(count as u64, Ordering::Relaxed);
                trace!("Flushed {} responses for {}", count, self.name);
                FlushOutcome::Sent(count)
            }
            Err(StreamError::ChannelClosed) => {
                batch.responses.clear();
                batch.disconnected = true;
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_responses
                    .fetch_add(count as u64, Ordering::Relaxed);
                warn!(
                    "Outbound channel closed, dropping {} responses for {}",
                    count, self.name
                );
                FlushOutcome::Closed(count)
            }
            Err(err) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Error flushing {} responses for {}: {}",
                    count, self.name, err
                );
                FlushOutcome::Retained(count)
            }
        }
    }

    /// Returns the number of pending responses.
    pub fn pending(&self) -> usize {
        self.lock().responses.len()
    }

    /// Returns true once the channel was found closed.
    pub fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }

    /// Returns true once the completion marker has been appended.
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// Returns the flush threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Returns flush counters.
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Starts flushing every `period` on the current tokio runtime.
    ///
    /// The first tick fires one period from now. The timer holds only a weak
    /// reference and stops by itself once the scheduler is dropped.
    pub fn start_timer(self: &Arc<Self>, period: Duration) -> FlushTimer {
        let period = period.max(Duration::from_millis(1));
        let scheduler = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.flush();
            }
        });
        FlushTimer { handle }
    }
}

/// Handle to a periodic flush task. Dropping it cancels the timer.
#[derive(Debug)]
pub struct FlushTimer {
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Stops future timer-driven flushes.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns true once the timer task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
