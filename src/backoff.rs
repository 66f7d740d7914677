//! Exponential backoff with jitter.
//!
//! `delay = min(base * multiplier^(attempt - 1), max)`, scaled by a uniform
//! factor in `[0.75, 1.25]`, floored to whole minutes and clamped to at least
//! one minute. `attempt <= 0` means "no delay".

use chrono::{DateTime, Duration, FixedOffset};
use rand::Rng;

use crate::config::BackoffConfig;

/// Hard ceiling on any single delay (7 days).
pub const MAX_DELAY_CAP_MINUTES: i64 = 10_080;

const JITTER_LOW: f64 = 0.75;
const JITTER_HIGH: f64 = 1.25;

/// Attempt-count to retry-delay policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub base_delay_minutes: i64,
    pub multiplier: f64,
    pub max_delay_minutes: i64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for ExponentialBackoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay_minutes: config.base_delay_minutes,
            multiplier: config.multiplier,
            max_delay_minutes: config.max_delay_minutes,
            jitter: config.jitter,
        }
    }
}

impl ExponentialBackoff {
    /// Clamped, un-jittered delay in minutes.
    pub fn base_delay(&self, attempt: i32) -> f64 {
        if attempt <= 0 {
            return 0.0;
        }
        let raw = self.base_delay_minutes as f64 * self.multiplier.powi(attempt - 1);
        raw.min(self.max_delay_minutes.min(MAX_DELAY_CAP_MINUTES) as f64)
    }

    /// Delay in minutes using the thread-local random source.
    pub fn delay_minutes(&self, attempt: i32) -> i64 {
        let mut rng = rand::thread_rng();
        self.delay_minutes_with(attempt, &mut rng)
    }

    /// Delay in minutes drawing jitter from `rng`; deterministic for a fixed source.
    pub fn delay_minutes_with<R: Rng + ?Sized>(&self, attempt: i32, rng: &mut R) -> i64 {
        if attempt <= 0 {
            return 0;
        }
        let base = self.base_delay(attempt);
        let factor = if self.jitter {
            rng.gen_range(JITTER_LOW..=JITTER_HIGH)
        } else {
            1.0
        };
        ((base * factor).floor() as i64).max(1)
    }

    /// `now` shifted by the delay for `attempt`.
    pub fn next_attempt_at(
        &self,
        now: DateTime<FixedOffset>,
        attempt: i32,
    ) -> DateTime<FixedOffset> {
        now + Duration::minutes(self.delay_minutes(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng, rngs::mock::StepRng};

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff {
            jitter: false,
            ..ExponentialBackoff::default()
        }
    }

    #[test]
    fn non_positive_attempts_have_no_delay() {
        let backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.delay_minutes_with(0, &mut rng), 0);
        assert_eq!(backoff.delay_minutes_with(-3, &mut rng), 0);
        assert_eq!(backoff.base_delay(0), 0.0);
    }

    #[test]
    fn grows_geometrically_until_capped() {
        let backoff = no_jitter();
        let mut rng = StepRng::new(0, 1);
        let delays: Vec<i64> = (1..=13)
            .map(|attempt| backoff.delay_minutes_with(attempt, &mut rng))
            .collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 1440, 1440]
        );
    }

    #[test]
    fn base_is_non_decreasing() {
        let backoff = ExponentialBackoff::default();
        let mut previous = 0.0;
        for attempt in 1..=40 {
            let base = backoff.base_delay(attempt);
            assert!(base >= previous, "attempt {attempt} shrank");
            assert!(base <= 1440.0);
            previous = base;
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 1..=15 {
            let base = backoff.base_delay(attempt);
            for _ in 0..200 {
                let delay = backoff.delay_minutes_with(attempt, &mut rng);
                let low = ((base * JITTER_LOW).floor() as i64).max(1);
                let high = ((base * JITTER_HIGH).floor() as i64).max(1);
                assert!(delay >= 1);
                assert!(
                    (low..=high).contains(&delay),
                    "attempt {attempt}: {delay} outside [{low}, {high}]"
                );
            }
        }
    }

    #[test]
    fn lowest_jitter_is_clamped_to_one_minute() {
        let backoff = ExponentialBackoff::default();
        // A zero source yields the low end of the jitter range.
        let mut rng = StepRng::new(0, 0);
        assert_eq!(backoff.delay_minutes_with(1, &mut rng), 1);
        assert_eq!(backoff.delay_minutes_with(3, &mut rng), 3);
        assert_eq!(backoff.delay_minutes_with(11, &mut rng), 768);
        assert_eq!(backoff.delay_minutes_with(12, &mut rng), 1080);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let backoff = ExponentialBackoff::default();
        let first: Vec<i64> = {
            let mut rng = StdRng::seed_from_u64(99);
            (1..=8).map(|a| backoff.delay_minutes_with(a, &mut rng)).collect()
        };
        let second: Vec<i64> = {
            let mut rng = StdRng::seed_from_u64(99);
            (1..=8).map(|a| backoff.delay_minutes_with(a, &mut rng)).collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn builds_from_config() {
        let config = BackoffConfig {
            base_delay_minutes: 5,
            multiplier: 3.0,
            max_delay_minutes: 60,
            jitter: false,
        };
        let backoff = ExponentialBackoff::from(&config);
        assert_eq!(backoff.base_delay(1), 5.0);
        assert_eq!(backoff.base_delay(2), 15.0);
        assert_eq!(backoff.base_delay(3), 45.0);
        assert_eq!(backoff.base_delay(4), 60.0);
    }

    #[test]
    fn oversized_max_is_held_to_a_week() {
        let backoff = ExponentialBackoff {
            max_delay_minutes: i64::MAX,
            ..no_jitter()
        };
        let mut rng = StepRng::new(0, 1);
        let delay = backoff.delay_minutes_with(200, &mut rng);
        assert_eq!(delay, MAX_DELAY_CAP_MINUTES);
        let _ = backoff.next_attempt_at(chrono::Utc::now().fixed_offset(), 200);
    }
}
