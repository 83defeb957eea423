//! Retry backoff policy.
//!
//! `delay(n) = min(base * 2^(n-1), max) + jitter`, jitter uniform in `[0, window)`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_window: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            jitter_window: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_window: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_window,
        }
    }

    /// Exponential delay without jitter. Attempt 0 is treated as 1.
    pub fn base_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before the retry following failed attempt `attempt`.
    pub fn delay(&self, attempt: i32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: i32, rng: &mut R) -> Duration {
        let window = self.jitter_window.as_millis() as u64;
        let jitter = if window == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..window))
        };
        self.base_for(attempt) + jitter
    }

    /// Absolute time of the next attempt.
    pub fn next_run(&self, now: DateTime<Utc>, attempt: i32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_exponential_growth() {
        let policy = no_jitter();
        let minutes: Vec<u64> = (1..=4).map(|a| policy.delay(a).as_secs() / 60).collect();
        assert_eq!(minutes, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_attempt_zero_is_first_attempt() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(-3), Duration::from_secs(60));
    }

    #[test]
    fn test_capped_at_max_delay() {
        let policy = no_jitter();
        assert_eq!(policy.delay(7), Duration::from_secs(3600));
        assert_eq!(policy.delay(i32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::from_millis(500),
        );
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=5 {
            let base = policy.base_for(attempt);
            for _ in 0..50 {
                let d = policy.delay_with(attempt, &mut rng);
                assert!(d >= base);
                assert!(d < base + Duration::from_millis(500));
            }
        }
    }

    #[test]
    fn test_jitter_can_exceed_cap() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        let mut rng = StdRng::seed_from_u64(1);
        let d = policy.delay_with(10, &mut rng);
        assert!(d >= Duration::from_secs(60) && d < Duration::from_secs(70));
    }

    #[test]
    fn test_next_run_is_in_future() {
        let policy = no_jitter();
        let now = Utc::now();
        assert_eq!(policy.next_run(now, 2), now + chrono::Duration::minutes(2));
    }
}
