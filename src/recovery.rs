// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Retry pacing for failed flushes
//!
//! A failed batch is never dropped; it waits at the front of the queue.
//! [`BackoffPolicy`] decides how long the pipeline must wait before the next
//! write attempt, and [`FailureTracker`] keeps the consecutive-failure count
//! that feeds it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest wait between two write attempts, whatever the policy says
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay policy applied after consecutive write failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Retry on the very next flush trigger
    Immediate,
    /// Constant delay between attempts
    Fixed {
        /// Delay between attempts in milliseconds
        delay_ms: u64,
    },
    /// Exponential backoff, capped
    Exponential {
        /// Delay after the first failure in milliseconds
        initial_delay_ms: u64,
        /// Upper bound in milliseconds
        max_delay_ms: u64,
        /// Multiplier per additional failure
        multiplier: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after `failures` consecutive failures
    ///
    /// Zero failures never delays. The delay saturates at the cap instead
    /// of giving up: retries are unbounded in count, bounded in spacing.
    /// No policy waits longer than [`MAX_BACKOFF_DELAY`].
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let delay = match self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = (failures - 1).min(63) as i32;
                let delay_ms = *initial_delay_ms as f64 * multiplier.powi(exponent);
                let capped = if delay_ms.is_finite() {
                    delay_ms.min(*max_delay_ms as f64)
                } else {
                    *max_delay_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        };
        delay.min(MAX_BACKOFF_DELAY)
    }

    /// Create an exponential policy with a 2x multiplier
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2.0,
        }
    }

    /// Create a fixed policy
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }
}

/// Consecutive failure bookkeeping for the flush loop
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    consecutive: u32,
    total: u64,
}

impl FailureTracker {
    /// Create a tracker with no failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed write; returns the new consecutive count
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.total += 1;
        self.consecutive
    }

    /// Record a successful write
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Current consecutive failures
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Failures since creation
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_never_waits() {
        let policy = BackoffPolicy::Immediate;
        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(5), Duration::ZERO);
    }

    #[test]
    fn test_fixed_delay() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(9), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_delays_clamped() {
        let fixed = BackoffPolicy::Fixed { delay_ms: u64::MAX };
        assert_eq!(fixed.delay_after(1), MAX_BACKOFF_DELAY);

        let exponential = BackoffPolicy::Exponential {
            initial_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
            multiplier: 10.0,
        };
        assert_eq!(exponential.delay_after(40), MAX_BACKOFF_DELAY);
    }

    #[test]
    fn test_failure_tracker() {
        let mut tracker = FailureTracker::new();
        assert_eq!(tracker.record_failure(), 1);
        assert_eq!(tracker.record_failure(), 2);
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        assert_eq!(tracker.total(), 2);
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_string(&BackoffPolicy::default()).unwrap();
        assert!(json.contains("\"kind\":\"exponential\""));
        let parsed: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, BackoffPolicy::default());
    }
}
