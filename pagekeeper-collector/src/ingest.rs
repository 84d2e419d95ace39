// Pagekeeper Collector - Telemetry ingest
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Request authentication, batch parsing and record retention.

use chrono::{DateTime, Utc};
use pagekeeper::MetricRecord;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

/// Why a telemetry request was not accepted
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("unknown session token")]
    UnknownToken,

    #[error("malformed batch: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },
}

impl IngestError {
    /// Whether the error is an authentication failure
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, IngestError::MissingToken | IngestError::UnknownToken)
    }
}

/// Session tokens allowed to write telemetry
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    tokens: HashSet<String>,
}

impl TokenSet {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check an `Authorization` header value
    pub fn authorize(&self, header: Option<&str>) -> Result<(), IngestError> {
        let header = header.ok_or(IngestError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(IngestError::MissingToken)?;

        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(IngestError::UnknownToken)
        }
    }
}

/// Parse a request body into a batch of records
///
/// The body is a JSON array of records. An empty array is valid and
/// accepts nothing.
pub fn parse_batch(body: &[u8]) -> Result<Vec<MetricRecord>, IngestError> {
    let records: Vec<MetricRecord> = serde_json::from_slice(body)?;

    for (index, record) in records.iter().enumerate() {
        if record.name().is_empty() {
            return Err(IngestError::InvalidRecord {
                index,
                reason: "metric name is empty".to_string(),
            });
        }
        if record.id().is_empty() {
            return Err(IngestError::InvalidRecord {
                index,
                reason: "record id is empty".to_string(),
            });
        }
    }

    Ok(records)
}

/// Stored record with its arrival time
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub received_at: DateTime<Utc>,
    pub record: MetricRecord,
}

/// Bounded in-memory record store, oldest dropped first
#[derive(Debug)]
pub struct RecordStore {
    records: Mutex<VecDeque<StoredRecord>>,
    capacity: usize,
    accepted: Mutex<u64>,
}

impl RecordStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            accepted: Mutex::new(0),
        }
    }

    /// Append a batch; returns how many records were accepted
    pub fn append(&self, batch: Vec<MetricRecord>, received_at: DateTime<Utc>) -> usize {
        let count = batch.len();
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for record in batch {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(StoredRecord {
                received_at,
                record,
            });
        }
        drop(records);

        *self
            .accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += count as u64;
        count
    }

    /// Records currently retained
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records accepted since start, including dropped ones
    pub fn accepted(&self) -> u64 {
        *self
            .accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Most recent records, newest last
    pub fn recent(&self, limit: usize) -> Vec<StoredRecord> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH: &str = r#"[
        {"name":"LCP","value":2100.5,"rating":"good","id":"v4-1","timestamp":"2025-01-01T00:00:00Z",
         "context":{"path":"/","environment":"production"}},
        {"name":"CLS","value":0.3,"rating":"poor","id":"v4-2","timestamp":"2025-01-01T00:00:01Z",
         "context":{"path":"/blog","environment":"production","navigationType":"reload"}}
    ]"#;

    #[test]
    fn test_authorize() {
        let tokens = TokenSet::new(["alpha", "beta"]);
        assert!(tokens.authorize(Some("Bearer alpha")).is_ok());
        assert!(matches!(
            tokens.authorize(Some("Bearer gamma")),
            Err(IngestError::UnknownToken)
        ));
        assert!(matches!(
            tokens.authorize(Some("Basic alpha")),
            Err(IngestError::MissingToken)
        ));
        assert!(matches!(
            tokens.authorize(Some("Bearer ")),
            Err(IngestError::MissingToken)
        ));
        assert!(tokens.authorize(None).unwrap_err().is_unauthorized());
    }

    #[test]
    fn test_empty_tokens_ignored() {
        let tokens = TokenSet::new(["", "alpha"]);
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn test_parse_batch() {
        let records = parse_batch(BATCH.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name(), "CLS");
        assert_eq!(
            records[1].context().navigation_type.as_deref(),
            Some("reload")
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_batch(b"{\"name\":\"LCP\"}"),
            Err(IngestError::Malformed(_))
        ));
        assert!(matches!(parse_batch(b"not json"), Err(IngestError::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_empty_name() {
        let body = BATCH.replace("\"CLS\"", "\"\"");
        let err = parse_batch(body.as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidRecord { index: 1, .. }));
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn test_store_drops_oldest() {
        let store = RecordStore::with_capacity(3);
        let batch = parse_batch(BATCH.as_bytes()).unwrap();

        assert_eq!(store.append(batch.clone(), Utc::now()), 2);
        assert_eq!(store.append(batch, Utc::now()), 2);

        assert_eq!(store.len(), 3);
        assert_eq!(store.accepted(), 4);
        let recent = store.recent(10);
        assert_eq!(recent[0].record.id(), "v4-2");
        assert_eq!(store.recent(1)[0].record.name(), "CLS");
    }
}
