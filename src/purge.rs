// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Cache purging
//!
//! [`CachePurger::purge_all`] empties every cache partition and removes
//! every background worker registration. It is a blunt instrument, used
//! only once staleness is confirmed. Deletions run in parallel and are
//! best effort: a failed deletion is logged and the purge carries on.

use crate::error::PurgeError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Named partitions of cached network responses
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Names of every partition
    async fn keys(&self) -> Result<Vec<String>, PurgeError>;

    /// Delete one partition; `Ok(false)` if it did not exist
    async fn delete(&self, name: &str) -> Result<bool, PurgeError>;
}

/// Background worker registrations, identified by scope
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Scopes of every registration
    async fn registrations(&self) -> Result<Vec<String>, PurgeError>;

    /// Remove one registration; `Ok(false)` if it did not exist
    async fn unregister(&self, scope: &str) -> Result<bool, PurgeError>;
}

/// What a purge achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Partitions deleted
    pub caches_deleted: usize,
    /// Partitions that could not be deleted or listed
    pub cache_failures: usize,
    /// Registrations removed
    pub workers_unregistered: usize,
    /// Registrations that could not be removed or listed
    pub worker_failures: usize,
}

impl PurgeReport {
    /// Whether every deletion succeeded
    pub fn is_complete(&self) -> bool {
        self.cache_failures == 0 && self.worker_failures == 0
    }
}

/// Deletes all caches and worker registrations
#[derive(Clone)]
pub struct CachePurger {
    caches: Arc<dyn CacheStorage>,
    workers: Arc<dyn WorkerRegistry>,
}

impl std::fmt::Debug for CachePurger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePurger").finish_non_exhaustive()
    }
}

impl CachePurger {
    /// Create a purger over the given backends
    pub fn new(caches: Arc<dyn CacheStorage>, workers: Arc<dyn WorkerRegistry>) -> Self {
        Self { caches, workers }
    }

    /// Delete everything, waiting for every deletion to settle
    pub async fn purge_all(&self) -> PurgeReport {
        let mut report = PurgeReport::default();
        let mut tasks: JoinSet<Deletion> = JoinSet::new();

        match self.caches.keys().await {
            Ok(names) => {
                for name in names {
                    let caches = Arc::clone(&self.caches);
                    tasks.spawn(async move {
                        let result = caches.delete(&name).await;
                        Deletion::Cache(name, result)
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot list caches, skipping cache purge");
                report.cache_failures += 1;
            }
        }

        match self.workers.registrations().await {
            Ok(scopes) => {
                for scope in scopes {
                    let workers = Arc::clone(&self.workers);
                    tasks.spawn(async move {
                        let result = workers.unregister(&scope).await;
                        Deletion::Worker(scope, result)
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot list worker registrations");
                report.worker_failures += 1;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Deletion::Cache(_, Ok(_))) => report.caches_deleted += 1,
                Ok(Deletion::Cache(name, Err(err))) => {
                    warn!(cache = %name, error = %err, "cache deletion failed");
                    report.cache_failures += 1;
                }
                Ok(Deletion::Worker(_, Ok(_))) => report.workers_unregistered += 1,
                Ok(Deletion::Worker(scope, Err(err))) => {
                    warn!(scope = %scope, error = %err, "worker unregistration failed");
                    report.worker_failures += 1;
                }
                Err(err) => {
                    warn!(error = %err, "purge task did not complete");
                    report.cache_failures += 1;
                }
            }
        }

        info!(
            caches_deleted = report.caches_deleted,
            workers_unregistered = report.workers_unregistered,
            failures = report.cache_failures + report.worker_failures,
            "cache purge finished"
        );
        report
    }
}

enum Deletion {
    Cache(String, Result<bool, PurgeError>),
    Worker(String, Result<bool, PurgeError>),
}

/// In-memory cache partitions
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    partitions: Mutex<BTreeSet<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryCacheStorage {
    /// Create storage holding the given partitions
    pub fn with_partitions<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partitions: Mutex::new(names.into_iter().map(Into::into).collect()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Add a partition
    pub fn insert(&self, name: impl Into<String>) {
        lock(&self.partitions).insert(name.into());
    }

    /// Make deletions of `name` fail
    pub fn fail_deletion_of(&self, name: impl Into<String>) {
        lock(&self.failing).insert(name.into());
    }

    /// Remaining partition names
    pub fn names(&self) -> Vec<String> {
        lock(&self.partitions).iter().cloned().collect()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn keys(&self) -> Result<Vec<String>, PurgeError> {
        Ok(self.names())
    }

    async fn delete(&self, name: &str) -> Result<bool, PurgeError> {
        if lock(&self.failing).contains(name) {
            return Err(PurgeError::DeleteCache {
                name: name.to_string(),
                reason: "partition locked".to_string(),
            });
        }
        Ok(lock(&self.partitions).remove(name))
    }
}

/// In-memory worker registrations
#[derive(Debug, Default)]
pub struct MemoryWorkerRegistry {
    scopes: Mutex<BTreeMap<String, String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryWorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `script` for `scope`
    pub fn register(&self, scope: impl Into<String>, script: impl Into<String>) {
        lock(&self.scopes).insert(scope.into(), script.into());
    }

    /// Make unregistration of `scope` fail
    pub fn fail_unregister_of(&self, scope: impl Into<String>) {
        lock(&self.failing).insert(scope.into());
    }

    /// Registered scopes
    pub fn scopes(&self) -> Vec<String> {
        lock(&self.scopes).keys().cloned().collect()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn registrations(&self) -> Result<Vec<String>, PurgeError> {
        Ok(self.scopes())
    }

    async fn unregister(&self, scope: &str) -> Result<bool, PurgeError> {
        if lock(&self.failing).contains(scope) {
            return Err(PurgeError::Unregister {
                scope: scope.to_string(),
                reason: "registration busy".to_string(),
            });
        }
        Ok(lock(&self.scopes).remove(scope).is_some())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
