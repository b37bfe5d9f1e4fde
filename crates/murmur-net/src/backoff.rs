//! Reconnect delay schedule.

use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Yields `base * factor^n`, capped, for at most `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let multiplier = self.policy.factor.saturating_pow(self.attempt);
        let delay = self
            .policy
            .base
            .checked_mul(multiplier)
            .unwrap_or(self.policy.cap)
            .min(self.policy.cap);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
            max_attempts: 7,
        }
    }

    #[test]
    fn test_exponential_then_capped() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(policy());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_huge_exponent_saturates_to_cap() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            max_attempts: 100,
            ..policy()
        });
        let last = std::iter::from_fn(|| backoff.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(30)));
    }
}
