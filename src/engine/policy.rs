// src/engine/policy.rs

//! Retry and timeout policy for the dispatch engine.

use std::time::Duration;

use crate::launch::DEFAULT_MAX_COMMAND_LEN;

/// Exponential backoff for transient provider errors.
///
/// Attempt `n` (1-based) that fails is followed by a delay of
/// `min(base_delay * 2^(n-1), max_delay)`. After `max_attempts` failed calls
/// the caller gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Everything the engine needs to bound a job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Retry policy for `create`.
    pub provision_retry: RetryPolicy,
    /// Upper bound on a single provider call (`create`, `poll`, `terminate`).
    pub request_timeout: Duration,
    /// How long an environment may take to report `Ready`.
    pub provision_timeout: Duration,
    pub poll_interval: Duration,
    /// Total transfer attempts (first try included).
    pub transfer_attempts: u32,
    pub transfer_retry_delay: Duration,
    /// Upper bound on one transfer attempt.
    pub transfer_timeout: Duration,
    pub start_timeout: Duration,
    /// How long a running command may go without an exit or health signal.
    pub run_window: Duration,
    pub max_command_len: usize,
    /// Tear the environment down after `Completed`/`Failed` too.
    pub terminate_on_finish: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            provision_retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            provision_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            transfer_attempts: 3,
            transfer_retry_delay: Duration::from_secs(1),
            transfer_timeout: Duration::from_secs(60),
            start_timeout: Duration::from_secs(30),
            run_window: Duration::from_secs(3600),
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            terminate_on_finish: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_backoff_doubles_until_cap() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..60_000,
            attempt in 1u32..64,
        ) {
            let p = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
            };
            prop_assert!(p.delay_for(attempt) <= p.max_delay);
            prop_assert!(p.delay_for(attempt) <= p.delay_for(attempt + 1));
        }
    }
}
