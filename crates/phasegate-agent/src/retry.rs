use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between retries of a failed phase attempt.
///
/// The delay before retry `n` (0-based) is `backoff_base_ms * 2^n`, capped
/// at `backoff_max_ms`. How many retries are allowed is a per-phase setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy with the given base and cap, in milliseconds.
    pub fn new(backoff_base_ms: u64, backoff_max_ms: u64) -> Self {
        Self {
            backoff_base_ms,
            backoff_max_ms,
        }
    }

    /// Retry immediately. Useful in tests.
    pub fn immediate() -> Self {
        Self::new(0, 0)
    }

    /// Delay before retry number `retry` (0 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, retry))
    }
}

fn compute_backoff(policy: &RetryPolicy, retry: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(retry));
    delay.min(policy.backoff_max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_base_ms, 1_000);
        assert_eq!(policy.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..7).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_backoff_saturates_on_huge_retry_count() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RetryPolicy::immediate().delay(5), Duration::ZERO);
    }
}
