//! Reconnect backoff and endpoint rotation.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(rename = "base_secs", with = "crate::config::secs")]
    pub base: Duration,
    #[serde(rename = "cap_secs", with = "crate::config::secs")]
    pub cap: Duration,
    /// Failed cycles tolerated on one endpoint before rotating away from it.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt - 1)`,
/// capped at `cap`.
#[must_use]
pub fn compute_backoff(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    policy
        .base
        .checked_mul(1u32 << exp)
        .map_or(policy.cap, |delay| delay.min(policy.cap))
}

/// Tracks which endpoint the next connect cycle starts from and how many
/// consecutive cycles have failed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverState {
    index: usize,
    attempt: u32,
    endpoints: usize,
}

impl FailoverState {
    pub fn new(endpoints: usize) -> Self {
        Self {
            index: 0,
            attempt: 1,
            endpoints: endpoints.max(1),
        }
    }

    /// Endpoint index the next cycle starts from.
    pub fn current(&self) -> usize {
        self.index
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset_attempts(&mut self) {
        self.attempt = 1;
    }

    /// Record a failed cycle and return how long to wait before the next one.
    /// After `max_attempts` failures the start index advances, wrapping around.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = compute_backoff(policy, self.attempt);
        if self.attempt >= policy.max_attempts.max(1) {
            self.index = (self.index + 1) % self.endpoints;
            self.attempt = 1;
        } else {
            self.attempt += 1;
        }
        delay
    }

    /// Record a connection to `index`; later cycles start from it.
    pub fn record_success(&mut self, index: usize) {
        self.index = index % self.endpoints;
        self.attempt = 1;
    }
}
