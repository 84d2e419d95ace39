// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry sink abstraction
//!
//! This module provides the traits for the remote telemetry write and for
//! the authenticated-session check that gates it, along with in-memory
//! implementations for tests and local runs.

use crate::error::SinkError;
use crate::metric::MetricRecord;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Remote store receiving metric batches
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Write one batch
    ///
    /// `Ok` means the backend acknowledged every record of the batch.
    async fn write(&self, batch: &[MetricRecord]) -> Result<(), SinkError>;
}

/// Answers whether the page currently has an authenticated session
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Check for an active authenticated session
    async fn has_active_session(&self) -> Result<bool, SinkError>;
}

/// Session provider with a switchable fixed answer
#[derive(Debug)]
pub struct StaticSession {
    active: AtomicBool,
}

impl StaticSession {
    /// Session that is signed in
    pub fn authenticated() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    /// Session that is anonymous
    pub fn anonymous() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// Sign in or out
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn has_active_session(&self) -> Result<bool, SinkError> {
        Ok(self.active.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    batches: Vec<Vec<MetricRecord>>,
    scripted_failures: VecDeque<SinkError>,
    attempts: usize,
}

/// In-memory sink recording every acknowledged batch
///
/// Failures can be scripted with [`MemorySink::fail_next`]; each write
/// consumes one scripted failure before succeeding again.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write fail with `error`
    pub fn fail_next(&self, error: SinkError) {
        self.lock().scripted_failures.push_back(error);
    }

    /// Batches acknowledged so far
    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        self.lock().batches.clone()
    }

    /// All acknowledged records, in write order
    pub fn records(&self) -> Vec<MetricRecord> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    /// Number of write attempts, successful or not
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write(&self, batch: &[MetricRecord]) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.attempts += 1;
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        state.batches.push(batch.to_vec());
        Ok(())
    }
}
