//! Reconnect delay policy.

use std::time::Duration;

/// Capped exponential backoff: `min(max, base * 2^attempt)`.
///
/// Pure function of the attempt number; the caller owns the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(32);
        let delay = self.base_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1_000, 30_000)
    }
}
