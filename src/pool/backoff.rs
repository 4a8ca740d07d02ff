//! Retry policy for failed connection attempts
//!
//! Delay before retry `n` (1-based) is `min(base * 2^(n-1), max)` plus up to
//! 10% random jitter. Authentication failures are never retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::driver::DriverError;

/// Fraction of the capped delay added as random jitter
const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Whether a failed connection attempt may be retried at all
    pub fn is_retryable(&self, error: &DriverError) -> bool {
        !error.is_authentication()
    }

    /// Exponential delay without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay before retry `attempt` (1-based), jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_range = (base.as_millis() as f64 * JITTER_FACTOR) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_capped() {
        let policy = RetryPolicy::new(10, 100, 1_000);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_within_ten_percent() {
        let policy = RetryPolicy::new(3, 200, 5_000);
        for attempt in 1..=4 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= base);
                assert!(delay <= base + base / 10);
            }
        }
    }

    #[test]
    fn test_authentication_not_retryable() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(&DriverError::authentication("Access denied")));
        assert!(policy.is_retryable(&DriverError::connection("Connection refused")));
    }
}
