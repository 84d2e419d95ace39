// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Simulated browsing session
//!
//! Walks through a page visit with in-memory browser facilities:
//! performance metrics are batched and flushed, then a new deployment
//! lands and the client purges its caches and reloads once.
//!
//! Run with: cargo run --example simulated_session

use pagekeeper::storage::BUILD_FINGERPRINT_KEY;
use pagekeeper::{
    BuildFingerprint, CachePurger, ClientStorage, CountingReloader, FreshnessConfig,
    FreshnessController, MemoryCacheStorage, MemorySink, MemoryStorage, MemoryWorkerHost,
    MemoryWorkerRegistry, MetricObservation, ReloadOutcome, SinkError, StaticSession,
    TelemetryConfig, TelemetryPipeline, UpdateWorkerCoordinator, VersionTracker, WorkerConfig,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    println!("=== Pagekeeper Simulated Session ===\n");

    // Telemetry
    println!("--- Telemetry ---");
    let sink = Arc::new(MemorySink::new());
    let pipeline = TelemetryPipeline::new(
        TelemetryConfig::default(),
        sink.clone(),
        Arc::new(StaticSession::authenticated()),
    );
    pipeline.init();
    pipeline.set_page_path("/services");

    let observations = [
        ("TTFB", 420.0),
        ("FCP", 1_310.0),
        ("LCP", 2_840.0),
        ("CLS", 0.04),
        ("INP", 180.0),
    ];
    for (i, (name, value)) in observations.iter().enumerate() {
        let action = pipeline.observe(MetricObservation::new(*name, *value, format!("v4-demo-{i}")));
        println!("  observed {name:<5} {value:>8.2} -> {action:?}");
    }

    sink.fail_next(SinkError::Network("offline".into()));
    println!("  flush while offline: {:?}", pipeline.flush().await);
    println!("  still pending:       {}", pipeline.pending());
    println!("  flush on unload:     {:?}", pipeline.dispose().await);

    for record in sink.records() {
        println!(
            "  stored {:<5} {:>8.2} ({})",
            record.name(),
            record.value(),
            record.rating()
        );
    }
    println!("  stats: {:?}\n", pipeline.stats());

    // Freshness
    println!("--- Freshness ---");
    let storage = Arc::new(MemoryStorage::new());
    if let Err(err) = storage.set(BUILD_FINGERPRINT_KEY, "1700000000000") {
        println!("  cannot seed storage: {err}");
        return;
    }

    let caches = Arc::new(MemoryCacheStorage::with_partitions([
        "workbox-precache-v2",
        "pages",
        "images",
    ]));
    let registry = Arc::new(MemoryWorkerRegistry::new());
    registry.register("/", "/sw.js");
    let reloader = Arc::new(CountingReloader::new());
    let coordinator = Arc::new(UpdateWorkerCoordinator::new(
        Arc::new(MemoryWorkerHost::new(true)),
        WorkerConfig::default(),
    ));

    let config = FreshnessConfig::default();
    let tracker = VersionTracker::new(
        BuildFingerprint::new("1735689600000"),
        storage.clone(),
        config.check_interval(),
    );
    let controller = FreshnessController::new(
        tracker,
        CachePurger::new(caches.clone(), registry.clone()),
        coordinator,
        reloader.clone(),
        config,
    );

    println!("  caches before:  {:?}", caches.names());
    match controller.init().await {
        Some(ReloadOutcome::Reloaded { trigger, purge }) => {
            println!("  reload by {trigger:?}");
            println!(
                "  purged {} caches, {} registrations",
                purge.caches_deleted, purge.workers_unregistered
            );
        }
        Some(ReloadOutcome::AlreadyTriggered) => println!("  reload already underway"),
        None => println!("  client is current"),
    }
    println!("  caches after:   {:?}", caches.names());
    println!("  reload count:   {}", reloader.count());
    println!(
        "  hero image url: {}",
        controller.decorate_url("/images/hero.jpg")
    );

    controller.dispose();
    println!("\n=== Done ===");
}
