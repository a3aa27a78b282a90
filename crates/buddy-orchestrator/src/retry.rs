use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter and a bounded attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized in either direction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the attempt that follows `failed_attempts` failures.
    ///
    /// `sample` is a uniform value in `[0, 1)`; 0.5 yields the unjittered delay.
    pub fn delay_for(&self, failed_attempts: u32, sample: f64) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
        let jittered = (raw as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }

    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let sample = rand::thread_rng().gen::<f64>();
        self.delay_for(failed_attempts, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1, 0.5), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, 0.5), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3, 0.5), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10, 0.5), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(160));
        assert_eq!(policy.delay_for(1, 1.0), Duration::from_millis(240));
        for _ in 0..100 {
            let delay = policy.backoff(2).as_millis();
            assert!((320..=480).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn ceiling_is_at_least_one() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.max_attempts(), 1);
    }
}
