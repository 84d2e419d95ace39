// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Build fingerprint tracking
//!
//! [`VersionTracker`] compares the fingerprint of the running client with
//! the last one persisted in client storage. The comparison itself is
//! cheap but its consequence (purge + reload) is not, so real comparisons
//! are rate limited through a persisted last-check timestamp.

use crate::error::StorageError;
use crate::storage::{ClientStorage, BUILD_FINGERPRINT_KEY, LAST_CACHE_REFRESH_KEY, LAST_CHECK_KEY};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Opaque token identifying a deployed build
///
/// Compared by equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildFingerprint(String);

impl BuildFingerprint {
    /// Wrap an existing token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Time-of-build token: milliseconds since the Unix epoch
    pub fn from_build_time(built_at: DateTime<Utc>) -> Self {
        Self(built_at.timestamp_millis().to_string())
    }

    /// Token baked in at compile time through `PAGEKEEPER_BUILD_ID`,
    /// falling back to the crate version
    pub fn from_env() -> Self {
        Self(
            option_env!("PAGEKEEPER_BUILD_ID")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
        )
    }

    /// Token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Detailed result of a freshness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Last real check is too recent; nothing compared
    RateLimited,
    /// No fingerprint stored yet; the current one was stored
    Seeded,
    /// Stored fingerprint matches the running client
    Current,
    /// Stored fingerprint differs from the running client
    UpdateAvailable {
        /// Fingerprint that was stored before this check
        stored: BuildFingerprint,
    },
}

impl UpdateCheck {
    /// Whether a purge and reload is due
    pub fn is_update(&self) -> bool {
        matches!(self, Self::UpdateAvailable { .. })
    }
}

/// Tracks the running build against the persisted one
pub struct VersionTracker {
    current: BuildFingerprint,
    storage: Arc<dyn ClientStorage>,
    check_interval: Duration,
}

impl fmt::Debug for VersionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionTracker")
            .field("current", &self.current)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl VersionTracker {
    /// Create a tracker for the running build
    pub fn new(
        current: BuildFingerprint,
        storage: Arc<dyn ClientStorage>,
        check_interval: Duration,
    ) -> Self {
        Self {
            current,
            storage,
            check_interval,
        }
    }

    /// Fingerprint of the running client
    pub fn current_fingerprint(&self) -> &BuildFingerprint {
        &self.current
    }

    /// Minimum spacing between two real comparisons
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Whether a newer (or at least different) build has been seen
    ///
    /// Rate-limited calls and first runs report no update.
    pub fn check_for_update(&self, now: DateTime<Utc>) -> Result<bool, StorageError> {
        Ok(self.check(now)?.is_update())
    }

    /// Run a freshness check and report what happened
    ///
    /// On a mismatch the current fingerprint is persisted, so the page
    /// loaded after the reload does not see the same mismatch again.
    pub fn check(&self, now: DateTime<Utc>) -> Result<UpdateCheck, StorageError> {
        if let Some(last) = self.read_timestamp(LAST_CHECK_KEY)? {
            let elapsed = now.signed_duration_since(last);
            let within_interval = elapsed
                .to_std()
                .map(|e| e < self.check_interval)
                .unwrap_or(false);
            if within_interval {
                debug!(last_check = %last, "freshness check rate limited");
                return Ok(UpdateCheck::RateLimited);
            }
        }

        self.storage.set(LAST_CHECK_KEY, &format_timestamp(now))?;

        let outcome = match self.storage.get(BUILD_FINGERPRINT_KEY)? {
            None => {
                self.storage
                    .set(BUILD_FINGERPRINT_KEY, self.current.as_str())?;
                debug!(fingerprint = %self.current, "seeded build fingerprint");
                UpdateCheck::Seeded
            }
            Some(stored) if stored == self.current.as_str() => UpdateCheck::Current,
            Some(stored) => {
                info!(
                    stored = %stored,
                    current = %self.current,
                    "build fingerprint changed"
                );
                self.storage
                    .set(BUILD_FINGERPRINT_KEY, self.current.as_str())?;
                UpdateCheck::UpdateAvailable {
                    stored: BuildFingerprint::new(stored),
                }
            }
        };

        Ok(outcome)
    }

    /// Persist the time of a cache purge
    pub fn record_cache_refresh(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.storage
            .set(LAST_CACHE_REFRESH_KEY, &format_timestamp(now))
    }

    /// Time of the last cache purge, if any
    pub fn last_cache_refresh(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.read_timestamp(LAST_CACHE_REFRESH_KEY)
    }

    /// Time of the last real freshness check, if any
    pub fn last_check(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.read_timestamp(LAST_CHECK_KEY)
    }

    fn read_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
            Err(err) => {
                warn!(key, value = %raw, error = %err, "ignoring unparseable timestamp");
                Ok(None)
            }
        }
    }
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn tracker(storage: Arc<MemoryStorage>, fingerprint: &str) -> VersionTracker {
        VersionTracker::new(BuildFingerprint::new(fingerprint), storage, HOUR)
    }

    #[test]
    fn test_first_run_seeds() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = tracker(storage.clone(), "100");

        assert_eq!(tracker.check(t0()).unwrap(), UpdateCheck::Seeded);
        assert_eq!(
            storage.get(BUILD_FINGERPRINT_KEY).unwrap(),
            Some("100".to_string())
        );
    }

    #[test]
    fn test_same_build_is_current() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(BUILD_FINGERPRINT_KEY, "100").unwrap();
        let tracker = tracker(storage, "100");

        assert!(!tracker.check_for_update(t0()).unwrap());
    }

    #[test]
    fn test_mismatch_detected_and_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(BUILD_FINGERPRINT_KEY, "100").unwrap();
        let tracker = tracker(storage.clone(), "200");

        assert_eq!(
            tracker.check(t0()).unwrap(),
            UpdateCheck::UpdateAvailable {
                stored: BuildFingerprint::new("100")
            }
        );
        assert_eq!(
            storage.get(BUILD_FINGERPRINT_KEY).unwrap(),
            Some("200".to_string())
        );
    }

    #[test]
    fn test_rate_limit_within_interval() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(BUILD_FINGERPRINT_KEY, "100").unwrap();
        let tracker = tracker(storage.clone(), "100");

        assert_eq!(tracker.check(t0()).unwrap(), UpdateCheck::Current);

        // A new deployment lands, but the interval has not elapsed
        storage.set(BUILD_FINGERPRINT_KEY, "300").unwrap();
        let later = t0() + chrono::Duration::minutes(59);
        assert_eq!(tracker.check(later).unwrap(), UpdateCheck::RateLimited);

        let after = t0() + chrono::Duration::minutes(61);
        assert!(tracker.check(after).unwrap().is_update());
    }

    #[test]
    fn test_future_last_check_does_not_block() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = tracker(storage.clone(), "100");
        let future = t0() + chrono::Duration::days(1);
        storage
            .set(LAST_CHECK_KEY, &future.to_rfc3339())
            .unwrap();

        assert_eq!(tracker.check(t0()).unwrap(), UpdateCheck::Seeded);
    }

    #[test]
    fn test_garbage_timestamp_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(LAST_CHECK_KEY, "yesterday-ish").unwrap();
        let tracker = tracker(storage, "100");

        assert_eq!(tracker.check(t0()).unwrap(), UpdateCheck::Seeded);
        assert_eq!(tracker.last_check().unwrap(), Some(t0()));
    }

    #[test]
    fn test_cache_refresh_timestamp() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = tracker(storage, "100");
        assert_eq!(tracker.last_cache_refresh().unwrap(), None);

        tracker.record_cache_refresh(t0()).unwrap();
        assert_eq!(tracker.last_cache_refresh().unwrap(), Some(t0()));
    }

    #[test]
    fn test_fingerprint_from_build_time() {
        let fp = BuildFingerprint::from_build_time(t0());
        assert_eq!(fp.as_str(), t0().timestamp_millis().to_string());
        assert!(!BuildFingerprint::from_env().as_str().is_empty());
    }
}
