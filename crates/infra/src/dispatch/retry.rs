//! Retry policy: backoff table, jitter, and the terminal-failure cutoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use herald_core::Transition;

/// Attempts allowed before a failure becomes terminal.
pub const MAX_ATTEMPTS: u32 = 5;

/// Base delays indexed by `min(attempt, 5) - 1`.
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(2 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(30 * 60),
];

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt number at which a failure is terminal.
    pub max_attempts: u32,
    /// Base delay per attempt; attempts past the end reuse the last entry.
    pub schedule: Vec<Duration>,
    /// Jitter factor (0.0-1.0): the delay moves uniformly within `base * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            schedule: BACKOFF_SCHEDULE.to_vec(),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Base delay for a 1-based attempt index, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.schedule.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt as usize).min(self.schedule.len()) - 1;
        self.schedule[idx]
    }

    /// Jittered delay for a 1-based attempt index.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, unit)
    }

    /// Delay with an explicit jitter position in `[-1.0, 1.0]`.
    ///
    /// `-1.0` is the shortest allowed delay, `1.0` the longest.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as f64;
        let jitter_ms = base_ms * self.jitter * unit.clamp(-1.0, 1.0);
        Duration::from_millis((base_ms + jitter_ms).max(0.0).round() as u64)
    }

    /// Check if another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Transition for a delivery failure on the record's `attempts`-th claim.
    pub fn on_failure(&self, attempts: u32, error: String, now: DateTime<Utc>) -> Transition {
        if !self.should_retry(attempts) {
            return Transition::Failed { error };
        }

        let delay = self.delay_for_attempt(attempts);
        Transition::Retry {
            error,
            next_attempt_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delays_follow_the_table() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_secs(10));
        assert_eq!(policy.base_delay(2), Duration::from_secs(30));
        assert_eq!(policy.base_delay(3), Duration::from_secs(120));
        assert_eq!(policy.base_delay(4), Duration::from_secs(600));
        assert_eq!(policy.base_delay(5), Duration::from_secs(1800));
        assert_eq!(policy.base_delay(9), Duration::from_secs(1800));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_with_jitter(1, -1.0), Duration::from_secs(8));
        assert_eq!(policy.delay_with_jitter(1, 0.0), Duration::from_secs(10));
        assert_eq!(policy.delay_with_jitter(1, 1.0), Duration::from_secs(12));
        // Out-of-range positions are clamped.
        assert_eq!(policy.delay_with_jitter(2, 5.0), Duration::from_secs(36));

        for attempt in 1..=5 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            for _ in 0..200 {
                let d = policy.delay_for_attempt(attempt).as_millis() as f64;
                assert!(d >= base * 0.8 - 1.0 && d <= base * 1.2 + 1.0, "{d} outside ±20% of {base}");
            }
        }
    }

    #[test]
    fn jittered_delays_never_decrease_with_attempts() {
        let policy = RetryPolicy::default();
        for attempt in 1..5 {
            let longest_here = policy.delay_with_jitter(attempt, 1.0);
            let shortest_next = policy.delay_with_jitter(attempt + 1, -1.0);
            assert!(longest_here <= shortest_next);
        }
    }

    #[test]
    fn fifth_failure_is_terminal() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        for attempts in 1..MAX_ATTEMPTS {
            match policy.on_failure(attempts, "err".to_string(), now) {
                Transition::Retry { next_attempt_at, .. } => assert!(next_attempt_at > now),
                other => panic!("attempt {attempts} should retry, got {other:?}"),
            }
        }

        assert_eq!(
            policy.on_failure(MAX_ATTEMPTS, "err".to_string(), now),
            Transition::Failed {
                error: "err".to_string()
            }
        );
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
    }
}
