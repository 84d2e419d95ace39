//! # Pagekeeper - Client runtime freshness and telemetry
//!
//! The two client-side mechanisms of a content-managed website that have
//! real engineering content behind them:
//!
//! - **Telemetry**: performance observations (Core Web Vitals and friends)
//!   are batched, debounced and shipped to a remote store without losing
//!   data on transient failure.
//! - **Freshness**: a client running code older than the latest deployment
//!   purges every cache and reloads exactly once, coordinating with the
//!   background update worker.
//!
//! Browser facilities (storage, caches, worker registration, session,
//! reload) sit behind traits so the logic runs and is tested anywhere.
//!
//! ## Quick Start
//!
//! ```rust
//! use pagekeeper::{
//!     MemorySink, MetricObservation, StaticSession, TelemetryConfig, TelemetryPipeline,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let sink = Arc::new(MemorySink::new());
//! let pipeline = TelemetryPipeline::new(
//!     TelemetryConfig::default(),
//!     sink.clone(),
//!     Arc::new(StaticSession::authenticated()),
//! );
//! pipeline.init();
//!
//! pipeline.observe(MetricObservation::new("LCP", 1840.0, "v4-1700000000000-1"));
//! pipeline.flush().await;
//!
//! assert_eq!(sink.records().len(), 1);
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`metric`]: metric records and ratings
//! - [`queue`]: FIFO metric queue with acknowledged removal
//! - [`sink`]: remote write and session traits
//! - [`pipeline`]: flush policy (size threshold, debounce, backoff)
//! - [`storage`]: persistent client storage
//! - [`version`]: build fingerprint tracking
//! - [`purge`]: cache and registration purging
//! - [`worker`]: update worker lifecycle
//! - [`freshness`]: purge-and-reload orchestration
//! - [`asset`]: cache-busting URL decoration

// Modules
pub mod asset;
pub mod config;
pub mod error;
pub mod freshness;
pub mod metric;
pub mod pipeline;
pub mod purge;
pub mod queue;
pub mod recovery;
pub mod sink;
pub mod storage;
pub mod version;
pub mod worker;

// Re-exports for convenient access
pub use asset::AssetUrlDecorator;
pub use config::{FreshnessConfig, RuntimeConfig, TelemetryConfig, WorkerConfig};
pub use error::{
    ConfigError, PagekeeperError, PurgeError, Result, SinkError, StorageError, WorkerError,
};
pub use freshness::{
    CountingReloader, FreshnessController, ReloadGuard, ReloadOutcome, ReloadTrigger, Reloader,
};
pub use metric::{MetricContext, MetricObservation, MetricRecord, Rating};
pub use pipeline::{EnqueueAction, FlushOutcome, PipelineStats, TelemetryPipeline};
pub use purge::{
    CachePurger, CacheStorage, MemoryCacheStorage, MemoryWorkerRegistry, PurgeReport,
    WorkerRegistry,
};
pub use queue::{Batch, MetricQueue};
pub use recovery::{BackoffPolicy, FailureTracker};
pub use sink::{MemorySink, SessionProvider, StaticSession, TelemetrySink};
pub use storage::{ClientStorage, FileStorage, MemoryStorage};
pub use version::{BuildFingerprint, UpdateCheck, VersionTracker};
pub use worker::{
    MemoryWorkerHost, UpdateWorkerCoordinator, UpdateWorkerState, WorkerEvent, WorkerHost,
    WorkerLifecycle, WorkerMessage, WorkerSignal,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
