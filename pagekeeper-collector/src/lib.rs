// Pagekeeper Collector - Telemetry ingest endpoint and Prometheus exporter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Pagekeeper Collector
//!
//! Server side of the telemetry pipeline: accepts metric batches written by
//! authenticated clients, exposes them as Prometheus metrics, and tells
//! clients which build is current.
//!
//! ## Endpoints
//!
//! - `POST /api/telemetry`: batch of records, `Authorization: Bearer <token>`
//! - `GET /api/build`: current build fingerprint
//! - `GET /metrics`: Prometheus text format
//! - `GET /health`, `GET /status`

pub mod ingest;
pub mod metrics;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ingest::{parse_batch, IngestError, RecordStore, TokenSet};
use metrics::{encode_metrics, record_batch, record_rejection, set_retained, RejectReason};
use pagekeeper::BuildFingerprint;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Application state shared across handlers.
pub struct AppState {
    pub tokens: TokenSet,
    pub fingerprint: BuildFingerprint,
    pub store: RecordStore,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(tokens: TokenSet, fingerprint: BuildFingerprint, retention: usize) -> Self {
        Self {
            tokens,
            fingerprint,
            store: RecordStore::with_capacity(retention),
            start_time: Instant::now(),
        }
    }
}

/// Build the collector router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/telemetry", post(telemetry_handler))
        .route("/api/build", get(build_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Root handler - shows a simple HTML page.
pub async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Pagekeeper Collector</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Pagekeeper Collector</h1>
    <p>Telemetry ingest for Pagekeeper clients.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div><code>POST /api/telemetry</code> - Metric batches (bearer token)</div>
        <div><a href="/api/build">/api/build</a> - Current build fingerprint</div>
        <div><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div><a href="/health">/health</a> - Health check</div>
        <div><a href="/status">/status</a> - Status information (JSON)</div>
    </div>
</body>
</html>"#,
    )
}

/// Accepted batch response.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub accepted: usize,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, reason) = if self.is_unauthorized() {
            (StatusCode::UNAUTHORIZED, RejectReason::Unauthorized)
        } else {
            (StatusCode::BAD_REQUEST, RejectReason::Malformed)
        };
        record_rejection(reason);
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Telemetry handler - stores an authenticated batch.
pub async fn telemetry_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), IngestError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if let Err(e) = state.tokens.authorize(authorization) {
        debug!("Rejected telemetry request: {}", e);
        return Err(e);
    }

    let records = parse_batch(&body).map_err(|e| {
        warn!("Rejected telemetry batch: {}", e);
        e
    })?;

    record_batch(&records);
    let accepted = state.store.append(records, Utc::now());
    set_retained(state.store.len());
    debug!(accepted, "telemetry batch stored");

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted })))
}

/// Build fingerprint response.
#[derive(Debug, Serialize)]
pub struct BuildResponse {
    pub fingerprint: String,
}

/// Build handler - returns the fingerprint of the current deployment.
pub async fn build_handler(State(state): State<Arc<AppState>>) -> Json<BuildResponse> {
    Json(BuildResponse {
        fingerprint: state.fingerprint.to_string(),
    })
}

/// Metrics handler - returns Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let metrics = encode_metrics();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Health check handler.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Status information response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub library_version: String,
    pub fingerprint: String,
    pub uptime_secs: u64,
    pub accepted_records: u64,
    pub retained_records: usize,
    pub tokens: usize,
}

/// Status handler - returns JSON status information.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        library_version: pagekeeper::VERSION.to_string(),
        fingerprint: state.fingerprint.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        accepted_records: state.store.accepted(),
        retained_records: state.store.len(),
        tokens: state.tokens.len(),
    })
}

/// Log the routes a freshly bound server answers on.
pub fn log_endpoints(addr: &std::net::SocketAddr) {
    info!("Starting server on http://{}", addr);
    info!("Telemetry endpoint: http://{}/api/telemetry", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);
}
