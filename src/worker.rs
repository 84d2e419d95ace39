// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Background update worker coordination
//!
//! The coordinator registers the update worker once the page has loaded,
//! follows its lifecycle events and, when an update is installed while an
//! older worker still controls the page, publishes
//! [`WorkerSignal::NewVersionReady`] to its subscribers.
//!
//! ```text
//! Unregistered -> Registering -> Idle(controlling)
//!                                  |
//!                                  v
//!   Activated <- Activating <- Installed(waiting) <- UpdateFound
//! ```

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle state reported by the runtime for an installing worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLifecycle {
    /// Install step running
    Installing,
    /// Installed, waiting to activate
    Installed,
    /// Activate step running
    Activating,
    /// Controlling clients
    Activated,
    /// Discarded by the runtime
    Redundant,
}

/// Event delivered by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A new worker started installing (`updatefound`)
    UpdateFound,
    /// The installing worker changed state (`statechange`)
    StateChange(WorkerLifecycle),
}

/// Coordinator view of the update worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateWorkerState {
    /// Not registered (yet, or unsupported)
    #[default]
    Unregistered,
    /// Registration in progress
    Registering,
    /// Registered, no update in progress
    Idle {
        /// Whether a worker controls the page
        controlling: bool,
    },
    /// A new worker is installing
    UpdateFound,
    /// The new worker is installed
    Installed {
        /// Whether it waits behind an active controller
        waiting: bool,
    },
    /// The new worker is activating
    Activating,
    /// The new worker is active
    Activated,
}

impl UpdateWorkerState {
    /// Check whether `next` is a legal successor
    pub fn can_transition_to(&self, next: &UpdateWorkerState) -> bool {
        use UpdateWorkerState::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Idle { .. })
                | (Registering, Unregistered)
                | (Idle { .. }, UpdateFound)
                | (UpdateFound, Installed { .. })
                | (UpdateFound, Idle { .. })
                | (Installed { .. }, Activating)
                | (Installed { .. }, Activated)
                | (Installed { .. }, UpdateFound)
                | (Installed { .. }, Idle { .. })
                | (Activating, Activated)
                | (Activating, Idle { .. })
                | (Activated, UpdateFound)
                | (Activated, Idle { .. })
        )
    }

    /// Whether an installed worker is waiting for the skip-waiting message
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Installed { waiting: true })
    }
}

/// Control message posted to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Take control now instead of waiting for every client to close
    SkipWaiting,
}

/// Signal published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// An update is installed and waiting behind the current controller
    NewVersionReady,
}

/// Runtime facilities for background workers
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Whether the runtime supports background workers at all
    fn is_supported(&self) -> bool;

    /// Register `script_url` as the update worker
    async fn register(&self, script_url: &str) -> Result<(), WorkerError>;

    /// Whether a worker currently controls the page
    fn has_controller(&self) -> bool;

    /// Post a message to the installed, waiting worker
    async fn post_to_waiting(&self, message: &WorkerMessage) -> Result<(), WorkerError>;
}

/// Drives the update worker lifecycle
pub struct UpdateWorkerCoordinator {
    host: Arc<dyn WorkerHost>,
    config: WorkerConfig,
    state: Mutex<UpdateWorkerState>,
    signals: broadcast::Sender<WorkerSignal>,
}

impl std::fmt::Debug for UpdateWorkerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateWorkerCoordinator")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl UpdateWorkerCoordinator {
    /// Create a coordinator; nothing is registered until [`on_load`](Self::on_load)
    pub fn new(host: Arc<dyn WorkerHost>, config: WorkerConfig) -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            host,
            config,
            state: Mutex::new(UpdateWorkerState::Unregistered),
            signals,
        }
    }

    /// Current state
    pub fn state(&self) -> UpdateWorkerState {
        *self.lock()
    }

    /// Receive [`WorkerSignal`]s published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerSignal> {
        self.signals.subscribe()
    }

    /// Register the worker; call after the page's load event
    ///
    /// Unsupported runtimes and registration failures leave the coordinator
    /// unregistered. Returns the resulting state.
    pub async fn on_load(&self) -> UpdateWorkerState {
        if !self.config.enabled {
            debug!("update worker disabled by configuration");
            return self.state();
        }
        if !self.host.is_supported() {
            debug!("background workers unsupported, skipping registration");
            return self.state();
        }
        if !self.transition(UpdateWorkerState::Registering) {
            return self.state();
        }

        match self.host.register(&self.config.script_url).await {
            Ok(()) => {
                let controlling = self.host.has_controller();
                self.transition(UpdateWorkerState::Idle { controlling });
                info!(
                    script = %self.config.script_url,
                    controlling,
                    "update worker registered"
                );
            }
            Err(err) => {
                warn!(
                    script = %self.config.script_url,
                    error = %err,
                    "update worker registration failed"
                );
                self.transition(UpdateWorkerState::Unregistered);
            }
        }
        self.state()
    }

    /// Apply a runtime event; returns the resulting state
    pub fn handle_event(&self, event: WorkerEvent) -> UpdateWorkerState {
        let next = match event {
            WorkerEvent::UpdateFound => UpdateWorkerState::UpdateFound,
            WorkerEvent::StateChange(WorkerLifecycle::Installing) => return self.state(),
            WorkerEvent::StateChange(WorkerLifecycle::Installed) => UpdateWorkerState::Installed {
                waiting: self.host.has_controller(),
            },
            WorkerEvent::StateChange(WorkerLifecycle::Activating) => UpdateWorkerState::Activating,
            WorkerEvent::StateChange(WorkerLifecycle::Activated) => UpdateWorkerState::Activated,
            WorkerEvent::StateChange(WorkerLifecycle::Redundant) => UpdateWorkerState::Idle {
                controlling: self.host.has_controller(),
            },
        };

        if self.transition(next) && next.is_waiting() {
            info!("new version installed and waiting");
            if self.signals.send(WorkerSignal::NewVersionReady).is_err() {
                debug!("no subscriber for new version signal");
            }
        }
        self.state()
    }

    /// Tell the waiting worker to take control immediately
    pub async fn request_skip_waiting(&self) -> Result<(), WorkerError> {
        if !self.state().is_waiting() {
            return Err(WorkerError::NoWaitingWorker);
        }
        self.host.post_to_waiting(&WorkerMessage::SkipWaiting).await?;
        debug!("skip-waiting message posted");
        Ok(())
    }

    /// Delay between the skip-waiting message and the reload
    pub fn reload_delay(&self) -> std::time::Duration {
        self.config.reload_delay()
    }

    fn transition(&self, next: UpdateWorkerState) -> bool {
        let mut state = self.lock();
        if !state.can_transition_to(&next) {
            debug!(from = ?*state, to = ?next, "ignoring invalid worker transition");
            return false;
        }
        debug!(from = ?*state, to = ?next, "worker state transition");
        *state = next;
        true
    }

    fn lock(&self) -> MutexGuard<'_, UpdateWorkerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
struct MemoryHostState {
    registered: Vec<String>,
    posted: Vec<WorkerMessage>,
    registration_error: Option<WorkerError>,
    delivery_error: Option<String>,
}

/// Scriptable in-process worker host
#[derive(Debug)]
pub struct MemoryWorkerHost {
    supported: bool,
    controller: std::sync::atomic::AtomicBool,
    state: Mutex<MemoryHostState>,
}

impl MemoryWorkerHost {
    /// Host that supports workers; `controlled` says whether a worker
    /// already controls the page
    pub fn new(controlled: bool) -> Self {
        Self {
            supported: true,
            controller: std::sync::atomic::AtomicBool::new(controlled),
            state: Mutex::new(MemoryHostState::default()),
        }
    }

    /// Host without worker support
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new(false)
        }
    }

    /// Make the next registration fail
    pub fn fail_registration(&self, error: WorkerError) {
        self.lock().registration_error = Some(error);
    }

    /// Make the next message delivery fail with `reason`
    pub fn fail_delivery(&self, reason: impl Into<String>) {
        self.lock().delivery_error = Some(reason.into());
    }

    /// Set whether a worker controls the page
    pub fn set_controller(&self, controlled: bool) {
        self.controller
            .store(controlled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Scripts registered so far
    pub fn registered(&self) -> Vec<String> {
        self.lock().registered.clone()
    }

    /// Messages posted so far
    pub fn posted(&self) -> Vec<WorkerMessage> {
        self.lock().posted.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryHostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkerHost for MemoryWorkerHost {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn register(&self, script_url: &str) -> Result<(), WorkerError> {
        if !self.supported {
            return Err(WorkerError::Unsupported);
        }
        let mut state = self.lock();
        if let Some(err) = state.registration_error.take() {
            return Err(err);
        }
        state.registered.push(script_url.to_string());
        Ok(())
    }

    fn has_controller(&self) -> bool {
        self.controller.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn post_to_waiting(&self, message: &WorkerMessage) -> Result<(), WorkerError> {
        let mut state = self.lock();
        if let Some(reason) = state.delivery_error.take() {
            return Err(WorkerError::Message(reason));
        }
        state.posted.push(*message);
        Ok(())
    }
}
