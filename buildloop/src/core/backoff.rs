//! Backoff arithmetic for agent retries and merge-lock waits.
//!
//! Jitter is passed in by the caller so the computation stays deterministic.

use std::time::Duration;

/// Upper bound (exclusive) for retry jitter.
pub const MAX_JITTER: Duration = Duration::from_secs(1);

/// Bounded exponential backoff policy for agent invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-indexed).
    ///
    /// `min(base * 2^(attempt-1) + jitter, max)`; jitter is clamped to `[0, 1s)`.
    pub fn delay_after(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX);
        let jitter = jitter.min(MAX_JITTER - Duration::from_nanos(1));
        scaled.saturating_add(jitter).min(self.max_delay)
    }
}

/// Doubling poll interval used while waiting for the merge lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    next: Duration,
    cap: Duration,
}

impl PollBackoff {
    pub const INITIAL: Duration = Duration::from_secs(1);
    pub const CAP: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            next: Self::INITIAL,
            cap: Self::CAP,
        }
    }

    /// Return the current interval and double it for the next call (capped).
    pub fn next_interval(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.cap);
        current
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new()
    }
}
