//! Reconnect policies and per-instance retry bookkeeping.
//!
//! A policy is a pure mapping from the number of consecutive failures to
//! the delay before the next attempt (or `None` when it gives up). The
//! supervisor's failure handling is identical whatever the policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::RetryView;

/// How long to wait before reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time, never gives up.
    Fixed { delay: Duration },

    /// `min(base * 2^(n-1), max)`, giving up after `max_attempts` failures.
    Exponential {
        base: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl ReconnectPolicy {
    /// Policy of fleet instances: 5s, uncapped.
    pub fn fleet() -> Self {
        ReconnectPolicy::Fixed {
            delay: Duration::from_secs(5),
        }
    }

    /// Policy of the legacy single instance: 10s doubling up to 60s, 10 attempts.
    pub fn legacy() -> Self {
        ReconnectPolicy::Exponential {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    /// Delay before retry number `attempt` (1-based), `None` once exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Fixed { delay } => Some(*delay),
            ReconnectPolicy::Exponential {
                base,
                max,
                max_attempts,
            } => {
                if attempt > *max_attempts {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exponent);
                Some(delay.min(*max))
            }
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            ReconnectPolicy::Fixed { .. } => None,
            ReconnectPolicy::Exponential { max_attempts, .. } => Some(*max_attempts),
        }
    }
}

/// Consecutive-failure bookkeeping of one instance.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Failures since the last successful connect.
    pub attempt_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    /// Repair cycles entered over the instance's lifetime.
    pub repairs: u64,
    pub exhausted: bool,
}

impl RetryState {
    /// Records a failure and returns the delay the policy grants, if any.
    pub fn record_failure(&mut self, policy: &ReconnectPolicy, reason: &str) -> Option<Duration> {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.repairs += 1;
        self.last_failure_reason = Some(reason.to_string());

        match policy.delay(self.attempt_count) {
            Some(delay) => {
                self.next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
                Some(delay)
            }
            None => {
                self.next_attempt_at = None;
                self.exhausted = true;
                None
            }
        }
    }

    /// Successful connect: forget the failure streak.
    ///
    /// The lifetime repair counter and last reason are kept for observers.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.next_attempt_at = None;
        self.exhausted = false;
    }

    pub fn view(&self) -> RetryView {
        RetryView {
            attempt_count: self.attempt_count,
            next_attempt_at: self.next_attempt_at,
            last_failure_reason: self.last_failure_reason.clone(),
            repairs: self.repairs,
            exhausted: self.exhausted,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 10)]
    #[case(2, 20)]
    #[case(3, 40)]
    #[case(4, 60)]
    #[case(5, 60)]
    #[case(10, 60)]
    fn test_legacy_delays(#[case] attempt: u32, #[case] secs: u64) {
        assert_eq!(
            ReconnectPolicy::legacy().delay(attempt),
            Some(Duration::from_secs(secs))
        );
    }

    #[test]
    fn test_legacy_gives_up_after_cap() {
        assert_eq!(ReconnectPolicy::legacy().delay(11), None);
        assert_eq!(ReconnectPolicy::legacy().max_attempts(), Some(10));
    }

    #[test]
    fn test_exhaustion_marks_retry_state() {
        let policy = ReconnectPolicy::legacy();
        let mut retry = RetryState::default();
        for _ in 0..10 {
            assert!(retry.record_failure(&policy, "refused").is_some());
        }
        assert!(!retry.exhausted);

        assert_eq!(retry.record_failure(&policy, "refused"), None);
        assert!(retry.exhausted);
        assert!(retry.next_attempt_at.is_none());
        assert_eq!(retry.view().attempt_count, 11);
    }

    #[test]
    fn test_reset_keeps_lifetime_counter() {
        let policy = ReconnectPolicy::fleet();
        let mut retry = RetryState::default();
        retry.record_failure(&policy, "closed");
        retry.record_failure(&policy, "timeout");

        retry.reset();

        assert_eq!(retry.attempt_count, 0);
        assert!(retry.next_attempt_at.is_none());
        assert_eq!(retry.repairs, 2);
        assert_eq!(retry.last_failure_reason.as_deref(), Some("timeout"));
    }

    proptest! {
        #[test]
        fn prop_fixed_policy_is_constant(attempt in 0u32..100_000) {
            prop_assert_eq!(
                ReconnectPolicy::fleet().delay(attempt),
                Some(Duration::from_secs(5))
            );
        }

        #[test]
        fn prop_exponential_is_monotonic_and_capped(attempt in 1u32..10) {
            let policy = ReconnectPolicy::legacy();
            let current = policy.delay(attempt).unwrap();
            let next = policy.delay(attempt + 1).unwrap();
            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_secs(60));
        }
    }
}
