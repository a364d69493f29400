//! Retry policy for activity execution.
//!
//! Exponential backoff with an upper bound and optional jitter. Only
//! retryable failures (transient, timeout) are retried; the policy never
//! decides business semantics.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::TaskFailure;

/// Retry policy for failed activity attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Spread each delay randomly by up to 25% either way
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate the base delay after a failed attempt (1-indexed), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay to wait after a failed attempt, with jitter applied when enabled
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let factor = rand::rng().random_range(-0.25..=0.25);
        base.mul_f64(1.0 + factor)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Check if a failure after `attempt` attempts should be retried
    pub fn should_retry_failure(&self, failure: &TaskFailure, attempt: u32) -> bool {
        failure.is_retryable() && self.should_retry(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_jitter_goes_both_ways() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            ..Default::default()
        };
        let base = Duration::from_millis(1000);

        let delays: Vec<Duration> = (0..500).map(|_| policy.backoff(1)).collect();
        assert!(delays.iter().any(|d| *d < base));
        assert!(delays.iter().any(|d| *d > base));
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_only_retryable_failures_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry_failure(&TaskFailure::transient("503"), 1));
        assert!(policy.should_retry_failure(&TaskFailure::timeout("slow"), 2));
        assert!(!policy.should_retry_failure(&TaskFailure::timeout("slow"), 3));
        assert!(!policy.should_retry_failure(&TaskFailure::business("declined"), 1));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 2000);
        assert!(policy.jitter);
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
