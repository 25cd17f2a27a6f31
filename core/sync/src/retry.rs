//! Exponential backoff between attempts of a failed item.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay, multiplied once per failed attempt.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before an item that has failed `retry_count` times is eligible again.
    ///
    /// `min(initial * multiplier^retry_count, max)`. Jitter (when enabled)
    /// never pushes the result past `max_delay`.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let max_ms = self.max_delay.as_millis() as f64;
        let capped_delay = base_delay.min(max_ms);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            (capped_delay * jitter_factor).min(max_ms)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_sequence() {
        let config = BackoffConfig::default();

        let delays: Vec<u64> = (1..=6)
            .map(|n| config.delay_for_attempt(n).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::default()
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let config = BackoffConfig::default().with_jitter(true);
        for _ in 0..100 {
            assert!(config.delay_for_attempt(20) <= Duration::from_secs(30));
        }
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_capped(start in 0u32..64, steps in 1usize..16) {
            let config = BackoffConfig::default();
            let mut previous = Duration::ZERO;
            for n in start..start + steps as u32 {
                let delay = config.delay_for_attempt(n);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(30_000));
                previous = delay;
            }
        }
    }
}
