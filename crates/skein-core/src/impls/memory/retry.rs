//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Backoff for adapter-initiated retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(rename = "baseDelayMs", with = "duration_ms")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Retry right away, no backoff.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Delay before the next attempt, given the attempts made so far
    /// (1-indexed): `base_delay * multiplier^(attempts - 1)`, capped at
    /// `max_delay`.
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - attempt 1 (first failure): 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::default();

        let d1 = policy.next_delay(1);
        let d2 = policy.next_delay(2);
        let d3 = policy.next_delay(3);

        assert!(d2 > d1);
        assert!(d3 > d2);
        assert_eq!(d1, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(2));
        assert_eq!(d3, Duration::from_secs(4));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(200), policy.max_delay);
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn immediate_policy_never_waits() {
        assert_eq!(RetryPolicy::immediate().next_delay(5), Duration::ZERO);
    }
}
