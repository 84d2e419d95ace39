//! Error types for Pagekeeper
//!
//! This module defines all error types used throughout the library.
//! None of them are meant to reach the page: the pipeline and the
//! freshness controller turn them into outcomes and log lines.

use thiserror::Error;

/// Result type alias for Pagekeeper operations
pub type Result<T> = std::result::Result<T, PagekeeperError>;

/// Main error type for Pagekeeper operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PagekeeperError {
    /// Telemetry write error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Persistent storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cache or registration deletion error
    #[error("Purge error: {0}")]
    Purge(#[from] PurgeError),

    /// Update worker error
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metric observation that cannot become a record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Errors while writing a batch to the remote store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Network failure before an acknowledgment was received
    #[error("Network error: {0}")]
    Network(String),

    /// Backend refused the batch
    #[error("Backend rejected batch: {status} {reason}")]
    Rejected { status: u16, reason: String },

    /// Write did not complete in time
    #[error("Write timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Session lookup itself failed
    #[error("Session lookup failed: {0}")]
    Session(String),
}

impl SinkError {
    /// Whether retrying the same batch later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } | Self::Session(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Errors from persistent client storage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Stored document could not be read back
    #[error("Corrupt storage document: {0}")]
    Corrupt(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Errors while purging caches and worker registrations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PurgeError {
    /// Partition names could not be listed
    #[error("Cannot enumerate caches: {0}")]
    Enumerate(String),

    /// One partition could not be deleted
    #[error("Cannot delete cache {name}: {reason}")]
    DeleteCache { name: String, reason: String },

    /// One registration could not be removed
    #[error("Cannot unregister worker {scope}: {reason}")]
    Unregister { scope: String, reason: String },
}

/// Errors from the background update worker host
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// Runtime has no background worker support
    #[error("Background workers are not supported by this runtime")]
    Unsupported,

    /// Registration was refused
    #[error("Registration of {script} failed: {reason}")]
    Registration { script: String, reason: String },

    /// No worker is waiting to receive a message
    #[error("No waiting worker")]
    NoWaitingWorker,

    /// Message could not be delivered
    #[error("Message delivery failed: {0}")]
    Message(String),
}

/// Errors in runtime configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A field has a value the pipeline cannot run with
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Document could not be parsed
    #[error("Cannot parse configuration: {0}")]
    Parse(String),

    /// File could not be read
    #[error("Cannot read configuration file: {0}")]
    Io(String),
}
