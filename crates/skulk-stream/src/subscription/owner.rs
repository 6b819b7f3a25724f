//! Subscriptions: the set of scan sessions streaming to one client.

use crate::error::Result;
use crate::point::{Tags, Timestamp};
use crate::store::DataStore;
use crate::subscription::response::OutboundChannel;
use crate::subscription::session::{Clock, MetricQuery, ScanHandle, ScanSession, SystemClock};
use crate::subscription::SessionConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};

/// Receives the end of every scan session it started.
pub trait SubscriptionOwner: Send + Sync {
    /// Called exactly once when the session scanning `metric` terminates,
    /// whatever the reason.
    fn scanner_complete(&self, metric: &str);
}

/// One client subscription streaming any number of metrics.
///
/// Each metric is scanned by its own [`ScanSession`] writing to the shared
/// outbound channel. Sessions are independent: one failing leaves the others
/// and the subscription running.
pub struct Subscription {
    subscription_id: String,
    session_id: String,
    store: Arc<dyn DataStore>,
    channel: Arc<dyn OutboundChannel>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    scanners: Mutex<HashMap<String, ScanHandle>>,
    this: Weak<Subscription>,
}

impl Subscription {
    /// Creates a subscription using the system clock.
    pub fn new(
        subscription_id: impl Into<String>,
        session_id: impl Into<String>,
        store: Arc<dyn DataStore>,
        channel: Arc<dyn OutboundChannel>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::with_clock(
            subscription_id,
            session_id,
            store,
            channel,
            config,
            Arc::new(SystemClock),
        )
    }

    /// Creates a subscription whose sessions read time from `clock`.
    pub fn with_clock(
        subscription_id: impl Into<String>,
        session_id: impl Into<String>,
        store: Arc<dyn DataStore>,
        channel: Arc<dyn OutboundChannel>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let subscription_id = subscription_id.into();
        let session_id = session_id.into();
        Arc::new_cyclic(|this| Self {
            subscription_id,
            session_id,
            store,
            channel,
            config,
            clock,
            scanners: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Returns the subscription id.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    fn scanners(&self) -> MutexGuard<'_, HashMap<String, ScanHandle>> {
        self.scanners.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Starts streaming `metric`. A session already streaming the metric is
    /// closed and replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_metric(
        &self,
        metric: &str,
        tags: Tags,
        start_time: Timestamp,
        end_time: Option<Timestamp>,
    ) -> Result<()> {
        let owner: Arc<dyn SubscriptionOwner> = match self.this.upgrade() {
            Some(this) => this,
            None => return Ok(()),
        };
        let query = MetricQuery::new(
            self.subscription_id.as_str(),
            self.session_id.as_str(),
            metric,
            tags,
            start_time,
            end_time,
        );
        let session = ScanSession::open_with_clock(
            query,
            self.store.as_ref(),
            Arc::clone(&self.channel),
            owner,
            self.config.clone(),
            Arc::clone(&self.clock),
        )?;
        info!("Adding metric {} to subscription {}", metric, self.subscription_id);

        let handle = session.spawn();
        let previous = {
            let mut scanners = self.scanners();
            let previous = scanners.remove(metric);
            // A session that already finished has reported completion.
            if !handle.is_closed() {
                scanners.insert(metric.to_string(), handle);
            }
            previous
        };
        if let Some(previous) = previous {
            debug!("Replacing scanner for {} in {}", metric, self.subscription_id);
            previous.close();
        }
        Ok(())
    }

    /// Stops streaming `metric` and returns its handle for joining.
    pub fn remove_metric(&self, metric: &str) -> Option<ScanHandle> {
        let handle = self.scanners().remove(metric)?;
        info!("Removing metric {} from subscription {}", metric, self.subscription_id);
        handle.close();
        Some(handle)
    }

    /// Returns the number of sessions still registered.
    pub fn active_scanners(&self) -> usize {
        self.scanners().len()
    }

    /// Returns the metrics being streamed.
    pub fn metrics(&self) -> Vec<String> {
        let mut metrics: Vec<_> = self.scanners().keys().cloned().collect();
        metrics.sort();
        metrics
    }

    /// Closes every session and returns their handles for joining.
    pub fn close(&self) -> Vec<ScanHandle> {
        let handles: Vec<_> = self.scanners().drain().map(|(_, handle)| handle).collect();
        info!(
            "Closing subscription {} with {} scanners",
            self.subscription_id,
            handles.len()
        );
        for handle in &handles {
            handle.close();
        }
        handles
    }
}

impl SubscriptionOwner for Subscription {
    fn scanner_complete(&self, metric: &str) {
        let mut scanners = self.scanners();
        // A replacement session may already be registered under the name.
        if scanners.get(metric).is_some_and(ScanHandle::is_closed) {
            scanners.remove(metric);
        }
        debug!(
            "Scanner for {} completed, {} remaining in {}",
            metric,
            scanners.len(),
            self.subscription_id
        );
    }
}
