//! Minimum-interval gate for position writes.
//!
//! Samples arriving inside the window are dropped, not queued: write volume
//! stays bounded and the next accepted sample carries no added latency.

use std::time::{Duration, Instant};

/// Default minimum spacing of forwarded samples.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_passed: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_passed: None,
        }
    }

    /// Let the sample through if the window since the last pass has elapsed.
    /// The first sample after construction or `reset` always passes.
    pub fn admit(&mut self, now: Instant) -> bool {
        let open = match self.last_passed {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if open {
            self.last_passed = Some(now);
        }
        open
    }

    /// Record a sample that bypassed the gate.
    pub fn mark(&mut self, now: Instant) {
        self.last_passed = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_passed = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_passed(&self) -> Option<Instant> {
        self.last_passed
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}
