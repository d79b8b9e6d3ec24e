use rand::Rng;
use std::time::Duration;

use crate::config::SchedulerConfig;

/// Exponential backoff: `min(base * 2^retry_count, max)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to 10% on top of the computed delay
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            jitter: config.retry_jitter,
        }
    }

    /// Delay before the retry that follows `retry_count` earlier retries
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_millis() as u64 / 10;
        let extra = rand::rng().random_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay.max(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubles_until_cap() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_huge_retry_count_saturates() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn jitter_stays_within_bounds(retry in 0u32..12, base in 1u64..5000) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base),
                max_delay: Duration::from_secs(600),
                jitter: true,
            };
            let plain = RetryPolicy { jitter: false, ..policy }.delay_for(retry);
            let jittered = policy.delay_for(retry);
            prop_assert!(jittered >= plain);
            prop_assert!(jittered <= plain + plain / 10 + Duration::from_millis(1));
        }
    }
}
