//! Injectable monotonic clock, so every state transition in this crate is
//! replayable from a test.

use std::sync::atomic::{AtomicU64, Ordering};

use web_time::Instant;

/// Monotonic milliseconds since some fixed epoch.
pub trait FrameClock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// The production clock.
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl FrameClock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1e3
    }
}

/// A hand-cranked clock for tests. Stores microseconds so `advance(0.5)`
/// keeps sub-millisecond precision.
#[derive(Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: f64) {
        debug_assert!(ms >= 0.0);
        self.micros.fetch_add((ms * 1e3) as u64, Ordering::Relaxed);
    }

    pub fn set_ms(&self, ms: f64) {
        self.micros.store((ms * 1e3) as u64, Ordering::Relaxed);
    }
}

impl FrameClock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1e3
    }
}
