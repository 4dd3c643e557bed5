//! Reconnect backoff policy.

use std::time::Duration;

/// Initial reconnect delay.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Upper bound on any single reconnect delay.
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Reconnect attempts before the session gives up and goes offline.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Exponential backoff: `min(base * 2^(attempt-1), cap)`.
///
/// Attempts are 1-indexed. With jitter enabled the delay is shortened by up
/// to 20%, so it never exceeds the un-jittered value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry
    pub base: Duration,
    /// Maximum delay
    pub cap: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
    /// Randomize delays to spread reconnect storms
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: false,
        }
    }
}

impl Backoff {
    /// Un-jittered delay before `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Delay before `attempt`, shortened by a fraction of `random` when
    /// jitter is enabled.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32, random: u32) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter {
            return delay;
        }

        let spread = delay.as_nanos() / 5;
        let offset = spread * u128::from(random) / u128::from(u32::MAX);
        delay.saturating_sub(Duration::from_nanos(u64::try_from(offset).unwrap_or(0)))
    }

    /// Whether `attempt` is past the retry budget.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn doubles_from_base_until_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (1..=7).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn exhausted_only_after_max_attempts() {
        let backoff = Backoff::default();
        assert!(!backoff.exhausted(8));
        assert!(backoff.exhausted(9));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(u32::MAX), DEFAULT_CAP);
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_and_capped(attempt in 1u32..64) {
            let backoff = Backoff::default();
            let current = backoff.delay(attempt);
            let next = backoff.delay(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= backoff.cap);
        }

        #[test]
        fn prop_jitter_stays_within_twenty_percent(attempt in 1u32..16, random in any::<u32>()) {
            let backoff = Backoff { jitter: true, ..Backoff::default() };
            let plain = backoff.delay(attempt);
            let jittered = backoff.jittered_delay(attempt, random);
            prop_assert!(jittered <= plain);
            prop_assert!(jittered >= plain - plain / 5);
        }
    }
}
