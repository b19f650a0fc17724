//! A bounded single-producer/single-consumer ring.
//!
//! The producer and consumer ends are separate owned handles, so the
//! single-producer/single-consumer discipline is enforced by the type system
//! rather than by documentation. Slots are uncontended mutexes (the workspace
//! denies `unsafe_code`); with one producer and one consumer a slot lock is
//! never contended, so this stays in the nanosecond range.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use web_time::Instant;

use crate::AdaptiveSpin;

struct Shared<T> {
    slots: Box<[Mutex<Option<T>>]>,
    mask: usize,

    /// Next slot to pop. Only advanced by the consumer.
    head: AtomicUsize,

    /// Next slot to push. Only advanced by the producer.
    tail: AtomicUsize,
}

/// Creates a ring with at least `capacity` slots (rounded up to a power of
/// two, minimum 2).
pub fn spsc_ring<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

pub struct RingProducer<T> {
    shared: Arc<Shared<T>>,
}

pub struct RingConsumer<T> {
    shared: Arc<Shared<T>>,
}

static_assertions::assert_impl_all!(RingProducer<u64>: Send, Sync);
static_assertions::assert_impl_all!(RingConsumer<u64>: Send, Sync);

impl<T> RingProducer<T> {
    /// Pushes without blocking; hands the value back if the ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.shared.mask {
            return Err(value);
        }
        *self.shared.slots[tail & self.shared.mask].lock() = Some(value);
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pushes, spinning adaptively for up to `timeout` if the ring is full.
    pub fn push_timeout(&self, mut value: T, timeout: Duration) -> Result<(), T> {
        let start = Instant::now();
        let mut spin = AdaptiveSpin::new();
        loop {
            match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }
            if start.elapsed() >= timeout {
                return Err(value);
            }
            spin.wait();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Has the consumer end been dropped?
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T> RingConsumer<T> {
    /// Pops without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.shared.slots[head & self.shared.mask].lock().take();
        debug_assert!(value.is_some(), "tail advanced past an empty slot");
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }

    /// Pops, spinning adaptively for up to `timeout` if the ring is empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let start = Instant::now();
        let mut spin = AdaptiveSpin::new();
        loop {
            if let Some(value) = self.try_pop() {
                return Some(value);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            spin.wait();
        }
    }

    /// Drains everything currently visible into `out`; returns the count.
    pub fn drain_into(&self, out: &mut Vec<T>) -> usize {
        let mut drained = 0;
        while let Some(value) = self.try_pop() {
            out.push(value);
            drained += 1;
        }
        drained
    }

    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Has the producer end been dropped?
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_capacity() {
        let (tx, rx) = spsc_ring::<u64>(4);
        for i in 0..4 {
            tx.try_push(i).unwrap();
        }
        assert_eq!(tx.try_push(99), Err(99));
        assert_eq!(tx.len(), 4);

        for i in 0..4 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn capacity_rounds_up() {
        let (tx, _rx) = spsc_ring::<u8>(5);
        for i in 0..8 {
            tx.try_push(i).unwrap();
        }
        assert_eq!(tx.try_push(8), Err(8));
    }

    #[test]
    fn cross_thread_stream() {
        let (tx, rx) = spsc_ring::<u64>(64);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000 {
                tx.push_timeout(i, Duration::from_secs(5)).unwrap();
            }
        });

        let mut expected = 0;
        while expected < 10_000 {
            if let Some(value) = rx.pop_timeout(Duration::from_secs(5)) {
                assert_eq!(value, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn detects_disconnect() {
        let (tx, rx) = spsc_ring::<u8>(2);
        assert!(!tx.is_disconnected());
        drop(rx);
        assert!(tx.is_disconnected());
    }
}
