//! One scan session per (subscription, metric).
//!
//! # State machine
//!
//! ```text
//!             entry                       exhausted, end_time set
//!   ┌──────► SCANNING ─────────────────────────────────────► COMPLETE ──► CLOSED
//!   │           │  │                                                        ▲
//!   └───────────┘  │ exhausted, open-ended                                  │
//!                  ▼                                                        │
//!                REARM ── flush, close, sleep(retry_delay), set_range ──►  SCANNING
//!
//!   any error / close request ─────────────────────────────────────────────┘
//! ```
//!
//! Leaving the loop by any path closes the flush timer, closes the scanner
//! and notifies the owner, exactly once. A closed outbound channel ends the
//! session the same way.
//!
//! Cells are held in a [`PointMerge`] until the scanner yields a record that
//! starts later, so points of several series reach the subscriber in
//! timestamp order.

use crate::codec;
use crate::error::{Result, StreamError};
use crate::point::{Tags, Timestamp};
use crate::store::{tail_boundary, DataStore, Key, RangeBound, RangeScanner, ScanRange, ScanRequest};
use crate::subscription::flush::{FlushOutcome, FlushScheduler, FlushTimer};
use crate::subscription::owner::SubscriptionOwner;
use crate::subscription::response::{JsonEncoder, MetricResponse, OutboundChannel};
use crate::subscription::SessionConfig;
use crate::window::{expand_cell, PointMerge};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Source of wall-clock time used for the tail boundary.
pub trait Clock: Send + Sync {
    /// Returns milliseconds since the Unix epoch.
    fn now_millis(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp::try_from(since.as_millis()).unwrap_or(Timestamp::MAX),
            Err(err) => -Timestamp::try_from(err.duration().as_millis()).unwrap_or(Timestamp::MAX),
        }
    }
}

/// States of the scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Pulling entries from the scanner.
    Scanning,
    /// The open-ended scan ran dry and is being re-ranged.
    Rearm,
    /// The bounded scan ran dry; the completion marker is sent.
    Complete,
    /// Terminal.
    Closed,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// A bounded query was fully delivered.
    Completed,
    /// The session was closed from outside.
    Cancelled,
    /// The outbound channel closed; pending responses were dropped.
    Disconnected,
    /// The session failed; the error was logged.
    Failed(StreamError),
}

/// What a session asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    /// Subscription id stamped on every response.
    pub subscription_id: String,
    /// Client session id, for logging.
    pub session_id: String,
    /// Metric to stream.
    pub metric: String,
    /// Tags every delivered point must carry.
    pub tags: Tags,
    /// Inclusive start time in milliseconds.
    pub start_time: Timestamp,
    /// Exclusive end time; `None` tails forever.
    pub end_time: Option<Timestamp>,
}

impl MetricQuery {
    /// Creates a query.
    pub fn new(
        subscription_id: impl Into<String>,
        session_id: impl Into<String>,
        metric: impl Into<String>,
        tags: Tags,
        start_time: Timestamp,
        end_time: Option<Timestamp>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            session_id: session_id.into(),
            metric: metric.into(),
            tags,
            start_time,
            end_time,
        }
    }

    /// Returns true if the query has no end time.
    pub fn is_open_ended(&self) -> bool {
        self.end_time.is_none()
    }
}

/// The range a session scans plus the last row it delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    /// Current scan range.
    pub range: ScanRange,
    /// Row of the last delivered point, if any.
    pub last_emitted: Option<Vec<u8>>,
}

impl ScanCursor {
    /// Creates a cursor over `range`.
    pub fn new(range: ScanRange) -> Self {
        Self {
            range,
            last_emitted: None,
        }
    }

    /// Records the row of a delivered point.
    pub fn record(&mut self, row: Vec<u8>) {
        self.last_emitted = Some(row);
    }

    /// Advances the range so it ends exclusively at `end_row` and returns it.
    ///
    /// Without a delivered point the start bound is kept as is; otherwise the
    /// range starts strictly after the last delivered row and keeps the
    /// previous end inclusivity.
    pub fn rearm(&mut self, end_row: Vec<u8>) -> &ScanRange {
        self.range = match &self.last_emitted {
            None => ScanRange {
                start: self.range.start.clone(),
                end: Some(RangeBound::new(end_row, false)),
            },
            Some(last) => ScanRange {
                start: Some(RangeBound::new(last.clone(), false)),
                end: Some(RangeBound::new(end_row, self.range.is_end_inclusive())),
            },
        };
        &self.range
    }
}

/// Cancellation state shared between a session and its handle.
struct SessionControl {
    name: String,
    closed: AtomicBool,
    wake: Notify,
    timer: Mutex<Option<FlushTimer>>,
}

impl SessionControl {
    fn new(name: String) -> Self {
        Self {
            name,
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            timer: Mutex::new(None),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn install_timer(&self, timer: FlushTimer) {
        let mut slot = self.timer.lock().unwrap_or_else(|err| err.into_inner());
        if self.is_closed() {
            timer.cancel();
            return;
        }
        *slot = Some(timer);
    }

    /// Marks the session closed and stops the flush timer.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Marking metric scanner closed: {}", self.name);
        }
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.wake.notify_waiters();
    }
}

/// Exclusive ownership of the store scanner.
///
/// Releasing closes the scanner and notifies the owner. It happens once,
/// either explicitly or when the lease is dropped with the session task.
struct ScannerLease {
    scanner: Box<dyn RangeScanner>,
    owner: Arc<dyn SubscriptionOwner>,
    metric: String,
    released: bool,
}

impl ScannerLease {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.scanner.close();
        self.owner.scanner_complete(&self.metric);
    }
}

impl Drop for ScannerLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Streams one metric of one subscription to the outbound channel.
pub struct ScanSession {
    name: String,
    query: MetricQuery,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    lease: ScannerLease,
    cursor: ScanCursor,
    merge: PointMerge,
    scheduler: Arc<FlushScheduler>,
    control: Arc<SessionControl>,
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSession")
            .field("name", &self.name)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl ScanSession {
    /// Opens the store scanner for `query` using the system clock.
    pub fn open(
        query: MetricQuery,
        store: &dyn DataStore,
        channel: Arc<dyn OutboundChannel>,
        owner: Arc<dyn SubscriptionOwner>,
        config: SessionConfig,
    ) -> Result<Self> {
        Self::open_with_clock(query, store, channel, owner, config, Arc::new(SystemClock))
    }

    /// Opens the store scanner for `query`.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot create a scanner. The owner is not notified
    /// in that case since no session was started.
    pub fn open_with_clock(
        query: MetricQuery,
        store: &dyn DataStore,
        channel: Arc<dyn OutboundChannel>,
        owner: Arc<dyn SubscriptionOwner>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let name = format!(
            "MetricScanner[subscriptionId={}, sessionId={}, metric={}, startTime={}, endTime={}, delay={:?}, tags={:?}]",
            query.subscription_id,
            query.session_id,
            query.metric,
            query.start_time,
            query.end_time.unwrap_or(0),
            config.retry_delay,
            query.tags
        );
        let request = ScanRequest::for_metric(
            query.session_id.clone(),
            query.metric.clone(),
            query.tags.clone(),
            query.start_time,
            query.end_time,
            config.lag,
            clock.now_millis(),
            config.scanner_batch_size,
            config.scanner_read_ahead,
        );
        let scanner = store.create_scanner_for_metric(&request)?;
        let cursor = ScanCursor::new(scanner.range().clone());
        let scheduler = Arc::new(FlushScheduler::new(
            name.clone(),
            config.subscription_batch_size,
            channel,
            Arc::new(JsonEncoder),
        ));
        trace!("Created {}", name);

        Ok(Self {
            lease: ScannerLease {
                scanner,
                owner,
                metric: query.metric.clone(),
                released: false,
            },
            control: Arc::new(SessionControl::new(name.clone())),
            name,
            query,
            config,
            clock,
            cursor,
            merge: PointMerge::new(),
            scheduler,
        })
    }

    /// Returns the identity string used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the session's flush scheduler.
    pub fn scheduler(&self) -> &Arc<FlushScheduler> {
        &self.scheduler
    }

    /// Runs the session on its own tokio task.
    pub fn spawn(self) -> ScanHandle {
        let control = Arc::clone(&self.control);
        let scheduler = Arc::clone(&self.scheduler);
        let task = tokio::spawn(self.run());
        ScanHandle {
            control,
            scheduler,
            task,
        }
    }

    /// Runs the scan loop to its end and releases the session's resources.
    pub async fn run(mut self) -> ExitReason {
        self.control
            .install_timer(self.scheduler.start_timer(self.config.flush_interval));

        let reason = match self.scan().await {
            Ok(reason) => reason,
            Err(err) => {
                error!("Error in metric scanner {}, closing: {}", self.name, err);
                ExitReason::Failed(err)
            }
        };

        self.control.close();
        self.lease.release();
        debug!("{} finished: {:?}", self.name, reason);
        reason
    }

    async fn scan(&mut self) -> Result<ExitReason> {
        let mut state = ScanState::Scanning;
        loop {
            state = match state {
                ScanState::Scanning => {
                    if self.control.is_closed() {
                        return Ok(ExitReason::Cancelled);
                    }
                    if self.scheduler.is_disconnected() {
                        return Ok(ExitReason::Disconnected);
                    }
                    let entry = self.lease.scanner.next_entry().await?;
                    match entry {
                        Some((key, value)) => {
                            self.deliver(key, &value)?;
                            ScanState::Scanning
                        }
                        None => {
                            self.release(None);
                            if self.query.is_open_ended() {
                                ScanState::Rearm
                            } else {
                                ScanState::Complete
                            }
                        }
                    }
                }
                ScanState::Rearm => {
                    if !self.rearm().await {
                        return Ok(ExitReason::Disconnected);
                    }
                    ScanState::Scanning
                }
                ScanState::Complete => {
                    debug!(
                        "Exhausted scanner, sending completed message for subscription {}",
                        self.query.subscription_id
                    );
                    self.scheduler
                        .append_completion(&self.query.subscription_id);
                    if let FlushOutcome::Closed(_) = self.scheduler.flush() {
                        return Ok(ExitReason::Disconnected);
                    }
                    ScanState::Closed
                }
                ScanState::Closed => return Ok(ExitReason::Completed),
            }
        }
    }

    /// Expands one stored cell into the merge, first handing over every
    /// pending point that cannot come after the cell's first point.
    fn deliver(&mut self, key: Key, value: &[u8]) -> Result<()> {
        let expansion = expand_cell(&key, value)?;
        let (_, first_ts) = codec::decode_row_key(&key.row)?;
        self.release(Some(first_ts));
        self.merge.push(key, expansion);
        Ok(())
    }

    /// Hands merged points up to `through`, or all of them, to the scheduler.
    fn release(&mut self, through: Option<Timestamp>) {
        while let Some(ts) = self.merge.peek_timestamp() {
            if through.is_some_and(|bound| ts > bound) {
                break;
            }
            let Some((_, point)) = self.merge.pop() else {
                break;
            };
            if !point.matches_tags(&self.query.tags) {
                continue;
            }
            self.cursor
                .record(codec::encode_row_key(&point.metric, point.timestamp));
            self.scheduler.append(MetricResponse::from_point(
                self.query.subscription_id.as_str(),
                point,
            ));
        }
    }

    /// Re-ranges the scanner after the retry delay. Returns false if the
    /// outbound channel turned out to be closed.
    async fn rearm(&mut self) -> bool {
        if let FlushOutcome::Closed(_) = self.scheduler.flush() {
            return false;
        }
        let end_time = tail_boundary(self.clock.now_millis(), self.config.lag);
        let end_row = codec::encode_row_key(&self.query.metric, end_time);

        let scanner = &mut self.lease.scanner;
        scanner.close();
        self.cursor.range = scanner.range().clone();
        let next = self.cursor.rearm(end_row).clone();

        match &self.cursor.last_emitted {
            None => debug!(
                "No results found for {}, waiting {:?} to retry with new end time {}",
                self.name, self.config.retry_delay, end_time
            ),
            Some(_) => debug!(
                "Exhausted scanner for {}, waiting {:?} to retry with new end time {}",
                self.name, self.config.retry_delay, end_time
            ),
        }
        pause(&self.control, self.config.retry_delay).await;
        self.lease.scanner.set_range(next);
        true
    }
}

/// Sleeps for `delay`, returning early if the session is closed.
async fn pause(control: &SessionControl, delay: Duration) {
    let woken = control.wake.notified();
    if control.is_closed() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = woken => {}
    }
}

/// Handle to a running [`ScanSession`].
#[derive(Debug)]
pub struct ScanHandle {
    control: Arc<SessionControl>,
    scheduler: Arc<FlushScheduler>,
    task: JoinHandle<ExitReason>,
}

impl fmt::Debug for SessionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionControl")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ScanHandle {
    /// Requests cooperative shutdown and stops the flush timer.
    ///
    /// An in-flight store read is allowed to finish; the loop stops before
    /// its next iteration.
    pub fn close(&self) {
        self.control.close();
    }

    /// Returns true once the session was closed, from either side.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Returns true once the session task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Returns the session's flush scheduler.
    pub fn scheduler(&self) -> &Arc<FlushScheduler> {
        &self.scheduler
    }

    /// Waits for the session to stop. `None` if the task panicked or was
    /// aborted.
    pub async fn join(self) -> Option<ExitReason> {
        self.task.await.ok()
    }
}
