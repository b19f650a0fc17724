//! Adaptive spin-wait for short, latency-sensitive waits.

use std::time::Duration;

/// Escalating backoff: spin hints first, then scheduler yields, then short
/// bounded sleeps.
///
/// Cheap when the wait turns out to be a few dozen nanoseconds, and does not
/// pin a core when it turns out to be milliseconds. Call [`AdaptiveSpin::wait`]
/// each time the condition you are waiting for is still false, and
/// [`AdaptiveSpin::reset`] (or drop it) once it became true.
#[derive(Default)]
pub struct AdaptiveSpin {
    rounds: u32,
}

impl AdaptiveSpin {
    const SPIN_ROUNDS: u32 = 16;
    const YIELD_ROUNDS: u32 = 48;
    const SLEEP_US: u64 = 50;

    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Back off once. Each call escalates until the backoff plateaus at a
    /// 50 µs sleep, keeping the worst-case wake latency bounded.
    #[inline]
    pub fn wait(&mut self) {
        if self.rounds < Self::SPIN_ROUNDS {
            for _ in 0..(1 << self.rounds.min(6)) {
                std::hint::spin_loop();
            }
        } else if self.rounds < Self::YIELD_ROUNDS {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(Self::SLEEP_US));
        }
        self.rounds = self.rounds.saturating_add(1);
    }

    /// Has this wait already escalated past the busy-spin phase?
    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.rounds >= Self::SPIN_ROUNDS
    }

    #[inline]
    pub fn reset(&mut self) {
        self.rounds = 0;
    }
}
