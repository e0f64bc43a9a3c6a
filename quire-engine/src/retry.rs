//! Exponential backoff policy shared by the direct save path and the
//! batch scheduler.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule: `base_delay_ms * 2^(retry - 1)`, capped at
/// `max_delay_ms`, plus up to `jitter` of the delay at random.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added at random, 0.0 - 1.0 (default: 0.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: 0.0,
        }
    }

    /// Whether an item that has already been retried `retry_count` times
    /// may be retried again.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let jitter = if self.jitter > 0.0 && base > 0 {
            let spread = (base as f64 * self.jitter.min(1.0)) as u64;
            if spread > 0 {
                rand::thread_rng().gen_range(0..=spread)
            } else {
                0
            }
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.max_delay_ms.max(base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 5000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            jitter: 0.5,
            max_delay_ms: 60_000,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let d = policy.delay_for(2).as_millis();
            assert!((2000..=3000).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }
}
