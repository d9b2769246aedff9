//! Exponential back-off schedule for reconnect attempts.

use std::time::Duration;

/// Reconnect delays growing geometrically from `lo` up to `hi`.
///
/// Each step multiplies the current delay by `ratio`, rounded up to the next
/// whole millisecond. A step that would exceed `hi` leaves the delay where it
/// is, so the schedule plateaus at the last value not above the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    hi: Duration,
    ratio: f64,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(lo: Duration, hi: Duration, ratio: f64) -> Self {
        Self {
            hi,
            ratio,
            current: lo,
            attempt: 0,
        }
    }

    /// Advance one step and return the delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let grown = (self.current.as_millis() as f64 * self.ratio).ceil() as u64;
        let grown = Duration::from_millis(grown);
        if grown <= self.hi {
            self.current = grown;
        }
        self.attempt += 1;
        self.current
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
