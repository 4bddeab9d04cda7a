//! Capped exponential reconnect backoff.

use std::time::Duration;

/// Reconnect delay schedule.
///
/// Delays double from `base` up to `max` and return to `base` after
/// `reset`. The sequence is non-decreasing between resets.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a schedule starting at `base`, capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = next.min(self.max);
        delay
    }

    /// Return to the minimum delay.
    pub const fn reset(&mut self) {
        self.current = self.base;
    }
}
