//! Reconnect backoff policy

use std::time::Duration;

/// Exponential backoff with a cap and a bounded number of retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Retries allowed after the initial attempt
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based): `min(base * 2^attempt, cap)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
