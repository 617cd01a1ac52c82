//! Retry policy: attempt budget and exponential backoff with jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::types::chrono_duration;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts a job gets before it is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap, applied after jitter.
    pub max_delay: Duration,
    /// Upper bound of the random stretch applied to each delay (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff without jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, given how many attempts have been made (1-indexed).
    ///
    /// `base * 2^(attempts - 1)` stretched by up to `jitter`, then capped at
    /// `max_delay`. Jitter only ever lengthens a delay and stays below the next
    /// step's doubling, so delays never shrink as attempts grow.
    pub fn delay_for_attempt<R: Rng>(&self, attempts: u32, rng: &mut R) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempts.saturating_sub(1).min(62) as i32);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let stretch = if jitter > 0.0 {
            1.0 + rng.gen_range(0.0..=jitter)
        } else {
            1.0
        };

        let delay_ms = (base_ms * exp * stretch).min(max_ms).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// When the next attempt is due.
    pub fn next_attempt_at<R: Rng>(
        &self,
        now: DateTime<Utc>,
        attempts: u32,
        rng: &mut R,
    ) -> DateTime<Utc> {
        now + chrono_duration(self.delay_for_attempt(attempts, rng))
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(policy.delay_for_attempt(1, &mut rng), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, &mut rng), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, &mut rng), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4, &mut rng), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.delay_for_attempt(40, &mut rng), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(3600))
            .with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = policy.delay_for_attempt(1, &mut rng);
            assert!(d >= Duration::from_secs(10) && d <= Duration::from_secs(15), "{d:?}");
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    proptest! {
        #[test]
        fn backoff_never_decreases(
            base_ms in 1u64..60_000,
            max_ms in 1u64..7_200_000,
            jitter in 0.0f64..=1.0,
            seed in any::<u64>(),
            attempts in 1u32..40,
        ) {
            let policy = RetryPolicy::exponential(50, Duration::from_millis(base_ms), Duration::from_millis(max_ms))
                .with_jitter(jitter);
            let mut rng = StdRng::seed_from_u64(seed);
            let current = policy.delay_for_attempt(attempts, &mut rng);
            let next = policy.delay_for_attempt(attempts + 1, &mut rng);
            prop_assert!(next >= current, "attempt {attempts}: {current:?} then {next:?}");
            prop_assert!(next <= Duration::from_millis(max_ms));
        }
    }
}
