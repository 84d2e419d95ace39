// Pagekeeper Collector - Telemetry ingest endpoint and Prometheus exporter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Pagekeeper Collector
//!
//! ## Usage
//!
//! ```bash
//! # Accept batches from two session tokens
//! pagekeeper-collector --token s3cr3t --token other
//!
//! # Custom port and announced build
//! pagekeeper-collector --port 9090 --fingerprint 1735689600000
//! ```

use clap::Parser;
use pagekeeper::BuildFingerprint;
use pagekeeper_collector::{ingest::TokenSet, log_endpoints, router, AppState};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Pagekeeper telemetry collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9200")]
    port: u16,

    /// Session token allowed to write telemetry (repeatable)
    #[arg(short, long = "token")]
    tokens: Vec<String>,

    /// Build fingerprint announced on /api/build
    #[arg(short, long)]
    fingerprint: Option<String>,

    /// Number of records kept in memory
    #[arg(long, default_value = "10000")]
    retention: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Pagekeeper Collector v{}", env!("CARGO_PKG_VERSION"));

    let tokens = TokenSet::new(args.tokens);
    if tokens.is_empty() {
        warn!("No session tokens configured, every telemetry request will be rejected");
    }

    let fingerprint = args
        .fingerprint
        .map(BuildFingerprint::new)
        .unwrap_or_else(BuildFingerprint::from_env);
    info!("Announcing build {}", fingerprint);

    let state = Arc::new(AppState::new(tokens, fingerprint, args.retention));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    log_endpoints(&addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
