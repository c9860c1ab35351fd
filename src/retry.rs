//! Exponential backoff shared by the API client and the batch writer.

use std::time::Duration;

/// Retry budget and delay schedule.
///
/// Attempt `n` (1-based, the first retry) waits `base * 2^(n-1)`,
/// capped at `max`. A server-provided delay replaces the computed one
/// but is capped the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries,
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self.base_ms.saturating_mul(1u64 << exp).min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry `attempt`, preferring a server hint.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(Duration::from_millis(self.max_ms)),
            None => self.delay(attempt),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, 500, 30_000)
    }
}
