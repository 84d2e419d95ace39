// Pagekeeper Collector - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for ingested telemetry.
//!
//! Every accepted record updates a counter and a histogram labeled by
//! metric name, so dashboards can chart Core Web Vitals per rating without
//! querying the record store.

use lazy_static::lazy_static;
use pagekeeper::MetricRecord;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // ============================================================
    // Ingested records
    // ============================================================

    /// Records accepted, by metric name and rating.
    pub static ref RECORDS_TOTAL: CounterVec = register_counter_vec!(
        "pagekeeper_records_total",
        "Metric records accepted by the collector",
        &["metric", "rating"]
    ).unwrap();

    /// Distribution of reported values, by metric name.
    /// Buckets cover millisecond timings; CLS lands in the first buckets.
    pub static ref METRIC_VALUE: HistogramVec = register_histogram_vec!(
        "pagekeeper_metric_value",
        "Reported metric values",
        &["metric"],
        vec![0.1, 0.25, 50.0, 100.0, 200.0, 500.0, 800.0, 1000.0, 1800.0, 2500.0, 4000.0, 8000.0]
    ).unwrap();

    // ============================================================
    // Requests
    // ============================================================

    /// Batches accepted.
    pub static ref BATCHES_TOTAL: CounterVec = register_counter_vec!(
        "pagekeeper_batches_total",
        "Telemetry batches accepted, by deployment environment",
        &["environment"]
    ).unwrap();

    /// Requests rejected, by reason.
    pub static ref REJECTED_TOTAL: CounterVec = register_counter_vec!(
        "pagekeeper_rejected_requests_total",
        "Telemetry requests rejected by the collector",
        &["reason"]
    ).unwrap();

    /// Records currently retained in memory.
    pub static ref RETAINED_RECORDS: Gauge = register_gauge!(
        "pagekeeper_retained_records",
        "Metric records currently retained by the collector"
    ).unwrap();
}

/// Reasons a telemetry request is turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Unauthorized,
    Malformed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::Malformed => "malformed",
        }
    }
}

/// Record an accepted batch.
pub fn record_batch(records: &[MetricRecord]) {
    let environment = records
        .first()
        .map(|r| r.context().environment.as_str())
        .unwrap_or("unknown");
    BATCHES_TOTAL.with_label_values(&[environment]).inc();

    for record in records {
        RECORDS_TOTAL
            .with_label_values(&[record.name(), record.rating().as_str()])
            .inc();
        METRIC_VALUE
            .with_label_values(&[record.name()])
            .observe(record.value());
    }
}

/// Record a rejected request.
pub fn record_rejection(reason: RejectReason) {
    REJECTED_TOTAL.with_label_values(&[reason.as_str()]).inc();
}

/// Update the retained record gauge.
pub fn set_retained(count: usize) {
    RETAINED_RECORDS.set(count as f64);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pagekeeper::{MetricContext, MetricObservation};

    fn record(name: &str, value: f64) -> MetricRecord {
        MetricRecord::from_observation(
            MetricObservation::new(name, value, "t-1"),
            MetricContext::new("/", "test"),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_reject_reason_as_str() {
        assert_eq!(RejectReason::Unauthorized.as_str(), "unauthorized");
        assert_eq!(RejectReason::Malformed.as_str(), "malformed");
    }

    #[test]
    fn test_encode_metrics() {
        record_batch(&[record("LCP", 1200.0), record("CLS", 0.02)]);
        record_rejection(RejectReason::Malformed);

        let output = encode_metrics();
        assert!(output.contains("pagekeeper_records_total"));
        assert!(output.contains("pagekeeper_metric_value"));
        assert!(output.contains("pagekeeper_rejected_requests_total"));
    }
}
