// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Freshness orchestration
//!
//! Two independent paths can decide that the page runs stale code:
//!
//! - the build fingerprint check ([`VersionTracker`]), at startup and then
//!   periodically;
//! - the update worker reporting an installed, waiting version
//!   ([`UpdateWorkerCoordinator`]).
//!
//! Both end in the same sequence: purge caches, hand control to the waiting
//! worker if there is one, reload. A single [`ReloadGuard`] shared by both
//! paths makes sure the page reloads at most once.

use crate::asset::AssetUrlDecorator;
use crate::config::FreshnessConfig;
use crate::purge::{CachePurger, PurgeReport};
use crate::version::{UpdateCheck, VersionTracker};
use crate::worker::{UpdateWorkerCoordinator, WorkerSignal};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Performs the actual page reload
pub trait Reloader: Send + Sync {
    /// Navigate to the current location again, bypassing the old code
    fn reload(&self);
}

/// Reloader that only counts calls
#[derive(Debug, Default)]
pub struct CountingReloader {
    count: AtomicUsize,
}

impl CountingReloader {
    /// Create a reloader that has never fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reloads requested
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Reloader for CountingReloader {
    fn reload(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Single-shot flag: the first claim wins, every later one loses
#[derive(Debug, Default)]
pub struct ReloadGuard {
    claimed: AtomicBool,
}

impl ReloadGuard {
    /// Create an unclaimed guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard; true only for the first caller
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the guard has been claimed
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// What detected the stale client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// Persisted build fingerprint differs from the running one
    VersionMismatch,
    /// Update worker installed a new version behind the current one
    WorkerReady,
}

/// Result of a purge-and-reload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// This call purged and reloaded
    Reloaded {
        /// Path that asked for it
        trigger: ReloadTrigger,
        /// Purge result
        purge: PurgeReport,
    },
    /// Another path already reloaded the page
    AlreadyTriggered,
}

struct ControllerInner {
    tracker: VersionTracker,
    purger: CachePurger,
    coordinator: Arc<UpdateWorkerCoordinator>,
    reloader: Arc<dyn Reloader>,
    guard: ReloadGuard,
    config: FreshnessConfig,
    decorator: AssetUrlDecorator,
}

/// Keeps the page on the latest deployment
pub struct FreshnessController {
    inner: Arc<ControllerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FreshnessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessController")
            .field("tracker", &self.inner.tracker)
            .field("reload_triggered", &self.inner.guard.is_claimed())
            .finish()
    }
}

impl FreshnessController {
    /// Create a controller; no check runs until [`init`](Self::init)
    pub fn new(
        tracker: VersionTracker,
        purger: CachePurger,
        coordinator: Arc<UpdateWorkerCoordinator>,
        reloader: Arc<dyn Reloader>,
        config: FreshnessConfig,
    ) -> Self {
        let decorator =
            AssetUrlDecorator::from_config(tracker.current_fingerprint().clone(), &config);
        Self {
            inner: Arc::new(ControllerInner {
                tracker,
                purger,
                coordinator,
                reloader,
                guard: ReloadGuard::new(),
                config,
                decorator,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the worker, run the startup check, start periodic checks
    ///
    /// A worker that is already installed and waiting is handed over right
    /// away. Returns the startup reload outcome, if it reloaded.
    pub async fn init(&self) -> Option<ReloadOutcome> {
        let mut signals = self.inner.coordinator.subscribe();
        let listener = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                loop {
                    match signals.recv().await {
                        Ok(WorkerSignal::NewVersionReady) => {
                            inner.purge_and_reload(ReloadTrigger::WorkerReady).await;
                            break;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "worker signal receiver lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };
        self.track(listener);

        // The ready signal is not replayed to late subscribers
        let outcome = if self.inner.coordinator.state().is_waiting() {
            debug!("update worker already waiting at init");
            Some(
                self.inner
                    .purge_and_reload(ReloadTrigger::WorkerReady)
                    .await,
            )
        } else {
            self.inner.check_at(Utc::now()).await
        };

        if self.inner.config.periodic_checks && outcome.is_none() {
            let inner = Arc::clone(&self.inner);
            let period = self.inner.config.check_interval();
            let periodic = tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                loop {
                    ticker.tick().await;
                    if inner.guard.is_claimed() {
                        break;
                    }
                    if inner.check_at(Utc::now()).await.is_some() {
                        break;
                    }
                }
            });
            self.track(periodic);
        }

        outcome
    }

    /// Stop the periodic check and the worker listener
    pub fn dispose(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("freshness controller disposed");
    }

    /// Run a freshness check as of `now`
    ///
    /// Returns `Some` when the check led to a purge-and-reload request.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Option<ReloadOutcome> {
        self.inner.check_at(now).await
    }

    /// Purge caches and reload, unless a reload already happened
    pub async fn purge_and_reload(&self, trigger: ReloadTrigger) -> ReloadOutcome {
        self.inner.purge_and_reload(trigger).await
    }

    /// Whether the page reload has been triggered
    pub fn reload_triggered(&self) -> bool {
        self.inner.guard.is_claimed()
    }

    /// Add the build fingerprint to a same-origin, non-hashed asset URL
    pub fn decorate_url<'a>(&self, url: &'a str) -> Cow<'a, str> {
        self.inner.decorator.decorate(url)
    }

    /// Underlying version tracker
    pub fn tracker(&self) -> &VersionTracker {
        &self.inner.tracker
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }
}

impl Drop for FreshnessController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ControllerInner {
    async fn check_at(&self, now: DateTime<Utc>) -> Option<ReloadOutcome> {
        match self.tracker.check(now) {
            Ok(UpdateCheck::UpdateAvailable { stored }) => {
                debug!(stored = %stored, "stale build detected by fingerprint");
                Some(self.purge_and_reload(ReloadTrigger::VersionMismatch).await)
            }
            Ok(outcome) => {
                debug!(?outcome, "freshness check");
                None
            }
            Err(err) => {
                warn!(error = %err, "freshness check failed, retrying next cycle");
                None
            }
        }
    }

    async fn purge_and_reload(&self, trigger: ReloadTrigger) -> ReloadOutcome {
        if !self.guard.try_claim() {
            debug!(?trigger, "reload already triggered, ignoring");
            return ReloadOutcome::AlreadyTriggered;
        }

        info!(?trigger, "stale client, purging caches before reload");
        let purge = self.purger.purge_all().await;
        if let Err(err) = self.tracker.record_cache_refresh(Utc::now()) {
            warn!(error = %err, "cannot record cache refresh time");
        }

        // Reloading before the new worker takes control would fetch from the old one
        if self.coordinator.state().is_waiting() {
            match self.coordinator.request_skip_waiting().await {
                Ok(()) => tokio::time::sleep(self.coordinator.reload_delay()).await,
                Err(err) => warn!(error = %err, "skip-waiting handoff failed"),
            }
        }

        info!(?trigger, "reloading page");
        self.reloader.reload();
        ReloadOutcome::Reloaded { trigger, purge }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_single_shot() {
        let guard = ReloadGuard::new();
        assert!(!guard.is_claimed());
        assert!(guard.try_claim());
        assert!(!guard.try_claim());
        assert!(guard.is_claimed());
    }

    #[test]
    fn test_guard_across_threads() {
        let guard = Arc::new(ReloadGuard::new());
        let winners: usize = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_claim())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_counting_reloader() {
        let reloader = CountingReloader::new();
        reloader.reload();
        assert_eq!(reloader.count(), 1);
    }
}
