//! Reconnect backoff and attempt counting.
//!
//! [`RetryPolicy`] is pure bookkeeping: the lifecycle manager reports each
//! connect failure and gets back either a delay to wait or a verdict to give
//! up. Only a successful connect resets the count.
//!
//! # Backoff
//!
//! The n-th consecutive failure (zero-based) waits
//! `min(base_delay * 2^n, max_delay)`. After `max_attempts` failures the
//! policy gives up.
//!
//! ```rust
//! use livevoice::session::retry::{RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let mut policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(8));
//! assert_eq!(policy.on_failure(), RetryDecision::RetryAfter(Duration::from_millis(500)));
//! assert_eq!(policy.on_failure(), RetryDecision::RetryAfter(Duration::from_millis(1000)));
//! assert_eq!(policy.on_failure(), RetryDecision::GiveUp);
//!
//! policy.on_success();
//! assert_eq!(policy.attempts(), 0);
//! ```

use crate::config::RetryConfig;
use std::time::Duration;
use tracing::{info, warn};

/// Attempt counters consulted by [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive connect failures since the last success.
    pub attempt_count: u32,
    /// Failures tolerated before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// What to do after a connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential, capped backoff over a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    state: RetryState,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: RetryState {
                attempt_count: 0,
                max_attempts: max_attempts.max(1),
                base_delay,
            },
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Record a failed connect and decide whether to try again.
    pub fn on_failure(&mut self) -> RetryDecision {
        let failed_index = self.state.attempt_count;
        self.state.attempt_count = self.state.attempt_count.saturating_add(1);

        if self.state.attempt_count >= self.state.max_attempts {
            warn!(
                attempts = self.state.attempt_count,
                "connect retries exhausted"
            );
            return RetryDecision::GiveUp;
        }

        let delay = self.delay_for(failed_index);
        info!(
            attempt = self.state.attempt_count,
            max_attempts = self.state.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "connect failed, retrying"
        );
        RetryDecision::RetryAfter(delay)
    }

    /// Record a successful connect.
    pub fn on_success(&mut self) {
        self.state.attempt_count = 0;
    }

    /// Consecutive failures since the last success.
    pub fn attempts(&self) -> u32 {
        self.state.attempt_count
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    fn delay_for(&self, index: u32) -> Duration {
        let factor = 1u32.checked_shl(index).unwrap_or(u32::MAX);
        self.state
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
