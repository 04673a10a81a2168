//! Exponential backoff for bulk loads and resubscription.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget and backoff curve.
///
/// The delay before attempt `n` (1-based, counting failures so far) is
/// `base_delay_ms * 2^(n-1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts before giving up
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let millis = self
            .base_delay_ms
            .saturating_mul(2u64.pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// True once `failures` has used up the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts.max(1)
    }
}
