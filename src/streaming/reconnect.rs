//! Reconnect backoff policy
//!
//! Delay for retry `n` (0-based) is `min(base * 2^n, max_delay)` plus a
//! uniform jitter in `[0, max_jitter)`. Retries stop after `max_attempts`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Automatic attempts allowed after a failure before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound on the exponential part of the delay
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) on the random jitter added to each delay
    pub max_jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_jitter_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never retries automatically
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Exponential part of the delay for retry `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Full delay for retry `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + Duration::from_millis(jitter_ms(self.max_jitter_ms))
    }

    /// Whether another automatic attempt is allowed after `attempts_used`
    pub fn should_retry(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }
}

/// Uniform-ish value in `[0, max)` without pulling in an RNG crate
fn jitter_ms(max: u64) -> u64 {
    static STREAM: AtomicU64 = AtomicU64::new(0);

    if max == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // splitmix64 over time ^ per-call stream so back-to-back calls differ
    let mut z = nanos ^ STREAM.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    z % max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_base_delay_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(16_000));
        assert_eq!(policy.base_delay(5), Duration::from_millis(30_000));
        assert_eq!(policy.base_delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_base_delay_is_non_decreasing() {
        let policy = ReconnectPolicy {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            ..Default::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..80 {
            let d = policy.base_delay(attempt);
            assert!(d >= previous, "attempt {} decreased", attempt);
            previous = d;
        }
    }

    #[test]
    fn test_delay_stays_below_cap_plus_jitter() {
        let policy = ReconnectPolicy::default();
        let bound = Duration::from_millis(policy.max_delay_ms + policy.max_jitter_ms);
        for attempt in 0..40 {
            for _ in 0..20 {
                let d = policy.delay(attempt);
                assert!(d < bound);
                assert!(d >= policy.base_delay(attempt));
            }
        }
    }

    #[test]
    fn test_no_jitter_when_disabled() {
        let policy = ReconnectPolicy {
            max_jitter_ms: 0,
            ..Default::default()
        };
        assert_eq!(policy.delay(3), policy.base_delay(3));
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!ReconnectPolicy::disabled().should_retry(0));
    }
}
