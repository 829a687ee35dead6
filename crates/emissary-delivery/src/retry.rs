//! Capped exponential backoff for failed enqueue and delivery attempts.
//!
//! The schedule is `base * 2^attempts` capped at `max_delay`, with optional
//! jitter for load distribution. The outbox dispatcher and the in-process
//! queue share this policy with different parameters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,

    /// Base delay for the exponential schedule.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction in `[0.0, 1.0]`; zero keeps the schedule exact.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
        }
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry at the specified time.
    Retry {
        /// When the next attempt may run.
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry.
    GiveUp {
        /// Why the attempt ladder ended.
        reason: String,
    },
}

impl RetryPolicy {
    /// Policy used by the in-process queue: 3 attempts, base 1 s.
    pub fn queue_default() -> Self {
        Self { max_attempts: 3, ..Self::default() }
    }

    /// Delay before the attempt following `attempts_made` failures.
    ///
    /// `attempts_made` counts completed failed attempts, so the first retry
    /// waits `base * 2^1` when called with 1.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay);
        std::cmp::min(apply_jitter(delay, self.jitter_factor), self.max_delay)
    }

    /// Decides whether to retry after `attempts_made` failed attempts.
    pub fn decide(&self, attempts_made: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        let delay = self.delay_after(attempts_made);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: now + chrono_delay }
    }
}

/// Randomizes a delay by up to `jitter_factor` in either direction.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_until_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(16));

        // base * 2^9 = 512s exceeds the 300s cap.
        assert_eq!(policy.delay_after(9), Duration::from_secs(300));
        assert_eq!(policy.delay_after(20), Duration::from_secs(300));
    }

    #[test]
    fn decide_gives_up_at_max_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.decide(5, now) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("must not retry at max attempts"),
        }
    }

    #[test]
    fn decide_schedules_future_retry() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.decide(2, now) {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!(next_attempt_at, now + chrono::Duration::seconds(4));
            },
            RetryDecision::GiveUp { .. } => unreachable!("attempts remain"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..Default::default() };
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let delay = policy.delay_after(3);
            assert!(delay >= Duration::from_secs(4), "delay too small: {delay:?}");
            assert!(delay <= Duration::from_secs(12), "delay too large: {delay:?}");
            seen.insert(delay.as_millis());
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn queue_policy_allows_three_attempts() {
        let policy = RetryPolicy::queue_default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }
}
