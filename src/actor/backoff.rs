//! Backoff policy for backend resolution retries.

use std::time::Duration;

/// Exponential backoff with a hard cap, keyed by attempt count.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl ReconnectBackoff {
    /// Policy with the given base and cap, both in milliseconds.
    #[must_use]
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before retrying after `attempt` failures.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u64 << shift;
        let bounded = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self { Self::new(100, 30_000) }
}
