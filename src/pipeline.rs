// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry pipeline
//!
//! [`TelemetryPipeline`] owns the [`MetricQueue`] for one page session and
//! decides when to ship it:
//!
//! - queue length reaches `batch_size`: flush now;
//! - otherwise: flush `debounce` after the most recent enqueue (every
//!   enqueue restarts the timer).
//!
//! A flush sends the whole queue as one batch. Only an acknowledged batch
//! leaves the queue; a failed one stays in front and the next attempt is
//! paced by the configured [`BackoffPolicy`](crate::recovery::BackoffPolicy).
//! Without an authenticated session the pending batch is dropped.
//!
//! The handle is cheap to clone. Timers run on the ambient tokio runtime.

use crate::config::TelemetryConfig;
use crate::error::SinkError;
use crate::metric::{MetricContext, MetricObservation, MetricRecord};
use crate::queue::{Batch, MetricQueue};
use crate::recovery::FailureTracker;
use crate::sink::{SessionProvider, TelemetrySink};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Empty,
    /// Another flush is already running
    InFlight,
    /// Batch acknowledged and removed from the queue
    Sent { count: usize },
    /// No authenticated session: the pending batch was dropped
    Discarded { count: usize },
    /// Write failed; the batch stays queued
    Failed { count: usize },
    /// A previous failure is still being backed off
    BackingOff { retry_in: Duration },
}

/// What an enqueue set in motion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueAction {
    /// Size threshold reached, flush started
    Flushing,
    /// Debounce timer (re)started
    Scheduled,
    /// Queued, pipeline not started yet
    Buffered,
    /// Pipeline disposed, record dropped
    Rejected,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records accepted by `enqueue`
    pub enqueued: u64,
    /// Records acknowledged by the sink
    pub sent: u64,
    /// Batches acknowledged by the sink
    pub batches: u64,
    /// Failed write attempts
    pub failed_attempts: u64,
    /// Records dropped for lack of a session
    pub discarded: u64,
    /// Records evicted because the queue was full
    pub evicted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Disposed,
}

struct PipelineState {
    lifecycle: Lifecycle,
    queue: MetricQueue,
    context: MetricContext,
    failures: FailureTracker,
    retry_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    stats: PipelineStats,
}

struct Shared {
    config: TelemetryConfig,
    sink: Arc<dyn TelemetrySink>,
    session: Arc<dyn SessionProvider>,
    state: Mutex<PipelineState>,
    flushing: AtomicBool,
    idle: Notify,
}

/// Clears the in-flight flag when the flush ends, cancelled or not,
/// and wakes tasks waiting for it.
struct FlightGuard<'a>(&'a Shared);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.flushing.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

/// Batching metric shipper for one page session
#[derive(Clone)]
pub struct TelemetryPipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TelemetryPipeline")
            .field("config", &self.shared.config)
            .field("lifecycle", &state.lifecycle)
            .field("pending", &state.queue.len())
            .field("flushing", &self.shared.flushing.load(Ordering::Relaxed))
            .finish()
    }
}

impl TelemetryPipeline {
    /// Create a pipeline; nothing is scheduled until [`init`](Self::init)
    pub fn new(
        config: TelemetryConfig,
        sink: Arc<dyn TelemetrySink>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        let state = PipelineState {
            lifecycle: Lifecycle::Created,
            queue: MetricQueue::with_max_len(config.max_queued),
            context: MetricContext::new("/", config.environment.clone()),
            failures: FailureTracker::new(),
            retry_at: None,
            timer: None,
            stats: PipelineStats::default(),
        };

        Self {
            shared: Arc::new(Shared {
                config,
                sink,
                session,
                state: Mutex::new(state),
                flushing: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Start applying the flush policy
    ///
    /// Records buffered before `init` are handled as if just enqueued.
    pub fn init(&self) {
        let mut state = self.shared.lock();
        if state.lifecycle != Lifecycle::Created {
            return;
        }
        state.lifecycle = Lifecycle::Running;
        debug!(pending = state.queue.len(), "telemetry pipeline started");

        if state.queue.len() >= self.shared.config.batch_size {
            drop(state);
            self.shared.spawn_flush();
        } else if !state.queue.is_empty() {
            self.shared
                .schedule_locked(&mut state, self.shared.config.debounce());
        }
    }

    /// Stop timers and make a last attempt to ship what is queued
    ///
    /// Backoff is ignored for this final attempt. Later enqueues are
    /// rejected.
    pub async fn dispose(&self) -> FlushOutcome {
        {
            let mut state = self.shared.lock();
            if state.lifecycle == Lifecycle::Disposed {
                return FlushOutcome::Empty;
            }
            state.lifecycle = Lifecycle::Disposed;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        let outcome = self.shared.flush(false).await;
        debug!(?outcome, "telemetry pipeline disposed");
        outcome
    }

    /// Queue a record and apply the flush policy
    ///
    /// Must run inside a tokio runtime for timers to be armed; outside one
    /// the record is still queued.
    pub fn enqueue(&self, record: MetricRecord) -> EnqueueAction {
        let mut state = self.shared.lock();
        if state.lifecycle == Lifecycle::Disposed {
            debug!(metric = record.name(), "pipeline disposed, dropping record");
            return EnqueueAction::Rejected;
        }

        state.stats.enqueued += 1;
        if let Some(evicted) = state.queue.push(record) {
            state.stats.evicted += 1;
            warn!(
                metric = evicted.name(),
                id = evicted.id(),
                max_queued = state.queue.max_len(),
                "metric queue full, evicted oldest record"
            );
        }

        if state.lifecycle == Lifecycle::Created {
            return EnqueueAction::Buffered;
        }

        if state.queue.len() >= self.shared.config.batch_size {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            drop(state);
            self.shared.spawn_flush();
            EnqueueAction::Flushing
        } else {
            self.shared
                .schedule_locked(&mut state, self.shared.config.debounce());
            EnqueueAction::Scheduled
        }
    }

    /// Stamp an observation with the current page context and queue it
    pub fn observe(&self, observation: MetricObservation) -> EnqueueAction {
        let context = self.shared.lock().context.clone();
        match MetricRecord::from_observation(observation, context, Utc::now()) {
            Ok(record) => self.enqueue(record),
            Err(err) => {
                warn!(error = %err, "ignoring invalid metric observation");
                EnqueueAction::Rejected
            }
        }
    }

    /// Update the path stamped on later observations
    pub fn set_page_path(&self, path: impl Into<String>) {
        self.shared.lock().context.path = path.into();
    }

    /// Send the whole queue now
    ///
    /// Concurrent calls do not start a second write: they return
    /// [`FlushOutcome::InFlight`].
    pub async fn flush(&self) -> FlushOutcome {
        self.shared.flush(true).await
    }

    /// Number of queued records
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Copy of the queued records, oldest first
    pub fn pending_records(&self) -> Vec<MetricRecord> {
        self.shared.lock().queue.iter().cloned().collect()
    }

    /// Diagnostic counters
    pub fn stats(&self) -> PipelineStats {
        self.shared.lock().stats
    }

    /// Consecutive failed writes
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.lock().failures.consecutive()
    }

    /// Whether a flush is running
    pub fn is_flushing(&self) -> bool {
        self.shared.flushing.load(Ordering::Acquire)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_flush(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, flush postponed");
            return;
        };
        let shared = Arc::clone(self);
        handle.spawn(async move {
            shared.flush(true).await;
        });
    }

    /// Replace the pending timer with one firing after `delay`.
    ///
    /// The timer hands the flush to its own task, so aborting a timer never
    /// cancels a write in progress.
    fn schedule_locked(self: &Arc<Self>, state: &mut PipelineState, delay: Duration) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, flush timer not armed");
            return;
        };
        let shared = Arc::clone(self);
        state.timer = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.spawn_flush();
        }));
    }

    async fn flush(self: &Arc<Self>, respect_backoff: bool) -> FlushOutcome {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return FlushOutcome::InFlight;
        }
        let _guard = FlightGuard(self);

        let batch = {
            let mut state = self.lock();
            if respect_backoff {
                if let Some(retry_at) = state.retry_at {
                    let now = Instant::now();
                    if retry_at > now {
                        let retry_in = retry_at - now;
                        if state.lifecycle == Lifecycle::Running {
                            self.schedule_locked(&mut state, retry_in);
                        }
                        return FlushOutcome::BackingOff { retry_in };
                    }
                }
            }
            state.queue.snapshot()
        };

        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        match self.session.has_active_session().await {
            Ok(true) => {}
            Ok(false) => return self.discard(&batch),
            Err(err) => return self.fail(&batch, err),
        }

        let timeout = self.config.write_timeout();
        let result = match tokio::time::timeout(timeout, self.sink.write(batch.records())).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => self.acknowledge(&batch),
            Err(err) => self.fail(&batch, err),
        }
    }

    fn acknowledge(self: &Arc<Self>, batch: &Batch) -> FlushOutcome {
        let mut state = self.lock();
        state.queue.acknowledge(batch);
        state.failures.record_success();
        state.retry_at = None;
        state.stats.sent += batch.len() as u64;
        state.stats.batches += 1;
        debug!(
            target: "pagekeeper::telemetry",
            count = batch.len(),
            remaining = state.queue.len(),
            "metric batch sent"
        );

        // Records that arrived while the write was in flight
        if state.lifecycle == Lifecycle::Running && !state.queue.is_empty() {
            if state.queue.len() >= self.config.batch_size {
                drop(state);
                self.spawn_after_flight();
            } else if state.timer.as_ref().map_or(true, |t| t.is_finished()) {
                self.schedule_locked(&mut state, self.config.debounce());
            }
        }

        FlushOutcome::Sent { count: batch.len() }
    }

    fn discard(self: &Arc<Self>, batch: &Batch) -> FlushOutcome {
        let mut state = self.lock();
        let count = state.queue.acknowledge(batch);
        state.stats.discarded += count as u64;
        debug!(
            target: "pagekeeper::telemetry",
            count,
            "no authenticated session, metric batch dropped"
        );

        if state.lifecycle == Lifecycle::Running
            && !state.queue.is_empty()
            && state.timer.as_ref().map_or(true, |t| t.is_finished())
        {
            self.schedule_locked(&mut state, self.config.debounce());
        }
        FlushOutcome::Discarded { count }
    }

    fn fail(self: &Arc<Self>, batch: &Batch, err: SinkError) -> FlushOutcome {
        let mut state = self.lock();
        let failures = state.failures.record_failure();
        let delay = self.config.backoff.delay_after(failures);
        state.retry_at = Some(Instant::now() + delay);
        state.stats.failed_attempts += 1;
        warn!(
            target: "pagekeeper::telemetry",
            error = %err,
            transient = err.is_transient(),
            count = batch.len(),
            consecutive_failures = failures,
            retry_in_ms = delay.as_millis() as u64,
            "metric batch write failed, keeping records queued"
        );

        if state.lifecycle == Lifecycle::Running && !delay.is_zero() {
            self.schedule_locked(&mut state, delay);
        }

        FlushOutcome::Failed { count: batch.len() }
    }

    /// Start a follow-up flush once no flush holds the in-flight flag.
    ///
    /// If another flush wins the flag first, its own acknowledgement takes
    /// care of whatever is still queued.
    fn spawn_after_flight(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(self);
        handle.spawn(async move {
            shared.wait_idle().await;
            shared.flush(true).await;
        });
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            // Register before reading the flag so a release in between is not missed
            idle.as_mut().enable();
            if !self.flushing.load(Ordering::Acquire) {
                return;
            }
            idle.await;
        }
    }
}
