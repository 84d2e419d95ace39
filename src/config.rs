// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Pagekeeper
//!
//! Durations are stored as milliseconds so the documents stay plain JSON.

use crate::error::ConfigError;
use crate::recovery::{BackoffPolicy, MAX_BACKOFF_DELAY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One hour: the documented freshness check interval.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Thirty days: the longest accepted freshness check interval.
pub const MAX_CHECK_INTERVAL_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Metric batching and shipping
    pub telemetry: TelemetryConfig,
    /// Stale build detection and asset cache busting
    pub freshness: FreshnessConfig,
    /// Background update worker
    pub worker: WorkerConfig,
}

impl RuntimeConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json_str(&raw)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.telemetry.validate()?;
        self.freshness.validate()?;
        self.worker.validate()
    }
}

/// Metric batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Queue length that triggers an immediate flush
    pub batch_size: usize,
    /// Quiet period after the latest enqueue before a flush (ms)
    pub debounce_ms: u64,
    /// Maximum queued records; the oldest are evicted beyond it
    pub max_queued: usize,
    /// Upper bound on a single write (ms)
    pub write_timeout_ms: u64,
    /// Pacing of retries after failed writes
    pub backoff: BackoffPolicy,
    /// Environment label stamped on every record
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            debounce_ms: 5_000,
            max_queued: 500,
            write_timeout_ms: 10_000,
            backoff: BackoffPolicy::default(),
            environment: "production".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Debounce delay
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_queued < self.batch_size {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.max_queued",
                reason: format!("must be >= batch_size ({})", self.batch_size),
            });
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.write_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        let max_backoff_ms = MAX_BACKOFF_DELAY.as_millis() as u64;
        let longest_delay_ms = match &self.backoff {
            BackoffPolicy::Immediate => 0,
            BackoffPolicy::Fixed { delay_ms } => *delay_ms,
            BackoffPolicy::Exponential { max_delay_ms, .. } => *max_delay_ms,
        };
        if longest_delay_ms > max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.backoff",
                reason: format!("delays above {max_backoff_ms} ms are not supported"),
            });
        }
        if let BackoffPolicy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } = &self.backoff
        {
            if initial_delay_ms > max_delay_ms {
                return Err(ConfigError::InvalidValue {
                    field: "telemetry.backoff",
                    reason: "initial delay exceeds max delay".to_string(),
                });
            }
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(ConfigError::InvalidValue {
                    field: "telemetry.backoff.multiplier",
                    reason: "must be finite and >= 1.0".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Freshness check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Minimum spacing between two real fingerprint comparisons (ms)
    pub check_interval_ms: u64,
    /// Whether to keep checking while the page stays open
    pub periodic_checks: bool,
    /// Path prefixes served from content-addressed storage
    pub hashed_asset_prefixes: Vec<String>,
    /// Query parameter carrying the fingerprint
    pub version_param: String,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            periodic_checks: true,
            hashed_asset_prefixes: vec!["/assets/".to_string()],
            version_param: "v".to_string(),
        }
    }
}

impl FreshnessConfig {
    /// Check interval, at most [`MAX_CHECK_INTERVAL_MS`]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.min(MAX_CHECK_INTERVAL_MS))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 || self.check_interval_ms > MAX_CHECK_INTERVAL_MS {
            return Err(ConfigError::InvalidValue {
                field: "freshness.check_interval_ms",
                reason: format!("must be between 1 and {MAX_CHECK_INTERVAL_MS}"),
            });
        }
        if self.version_param.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "freshness.version_param",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Background update worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Register the worker at all
    pub enabled: bool,
    /// Script path registered as the worker
    pub script_url: String,
    /// Delay between the skip-waiting message and the reload (ms)
    pub reload_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script_url: "/sw.js".to_string(),
            reload_delay_ms: 100,
        }
    }
}

impl WorkerConfig {
    /// Handoff delay before reloading
    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && !self.script_url.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "worker.script_url",
                reason: "must be a same-origin path".to_string(),
            });
        }
        Ok(())
    }
}
