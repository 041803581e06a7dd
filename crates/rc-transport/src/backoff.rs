//! Exponential reconnect backoff: 1s, 2s, 4s, ... capped at 60s.

use std::time::Duration;

const INITIAL_MS: u64 = 1_000;
const CAP_MS: u64 = 60_000;

/// Tracks the reconnect delay across a session's lifetime. Resets to
/// the initial delay after a successful join.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_ms: u64,
    cap_ms: u64,
    next_ms: u64,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::with_bounds(INITIAL_MS, CAP_MS)
    }

    /// Construct a backoff with a non-default initial delay and cap
    /// (both in milliseconds), for configurations that override the
    /// 1s/60s defaults.
    #[must_use]
    pub fn with_bounds(initial_ms: u64, cap_ms: u64) -> Self {
        let initial_ms = initial_ms.min(cap_ms.max(1)).max(1);
        Self {
            initial_ms,
            cap_ms: cap_ms.max(initial_ms),
            next_ms: initial_ms,
        }
    }

    /// The delay to wait before the next attempt, then doubles
    /// (capped at the configured ceiling) for the attempt after that.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_ms;
        self.next_ms = (self.next_ms.saturating_mul(2)).min(self.cap_ms);
        Duration::from_millis(delay)
    }

    /// Reset to the initial delay after a successful reconnect.
    pub fn reset(&mut self) {
        self.next_ms = self.initial_ms;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
