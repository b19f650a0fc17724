//! Reusable `Vec<u64>` scratch buffers with a thread-local cache.
//!
//! Overlap queries and speculative successor walks need short-lived address
//! buffers on hot paths. Rather than allocating each time, callers borrow a
//! buffer here and return it on drop. Each thread keeps up to
//! [`LOCAL_CAP`] buffers; overflow spills into a global bounded bag shared
//! by all threads (so worker threads that only ever release still feed
//! threads that only ever acquire).

use std::cell::RefCell;

use parking_lot::Mutex;

/// Max buffers cached per thread.
const LOCAL_CAP: usize = 8;

/// Max buffers in the shared spill bag.
const GLOBAL_CAP: usize = 64;

/// Don't pool buffers that grew past this; keeping them would let one
/// pathological query pin memory forever.
const MAX_POOLED_CAPACITY: usize = 64 * 1024;

thread_local! {
    static LOCAL: RefCell<Vec<Vec<u64>>> = const { RefCell::new(Vec::new()) };
}

static GLOBAL: Mutex<Vec<Vec<u64>>> = Mutex::new(Vec::new());

/// A pooled scratch buffer. Dereferences to `Vec<u64>`; returns to the pool
/// on drop.
pub struct ScratchBuf {
    buf: Vec<u64>,
}

impl ScratchBuf {
    /// Borrows a cleared buffer from the pool (or allocates a fresh one).
    pub fn take() -> Self {
        let buf = LOCAL
            .with(|local| local.borrow_mut().pop())
            .or_else(|| GLOBAL.lock().pop())
            .unwrap_or_default();
        debug_assert!(buf.is_empty());
        Self { buf }
    }

    /// Detaches the underlying vector from the pool.
    pub fn into_inner(mut self) -> Vec<u64> {
        std::mem::take(&mut self.buf)
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() == 0 || buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();

        let spilled = LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            if local.len() < LOCAL_CAP {
                local.push(std::mem::take(&mut buf));
                false
            } else {
                true
            }
        });

        if spilled {
            let mut global = GLOBAL.lock();
            if global.len() < GLOBAL_CAP {
                global.push(buf);
            }
        }
    }
}

impl std::ops::Deref for ScratchBuf {
    type Target = Vec<u64>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for ScratchBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_local_cache() {
        let mut buf = ScratchBuf::take();
        buf.extend([1, 2, 3]);
        let capacity = buf.capacity();
        drop(buf);

        // The same allocation comes back, cleared.
        let buf = ScratchBuf::take();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn overflow_spills_to_the_global_bag() {
        // Hold more buffers than the local cache fits, then release them all:
        // the local cache ends up exactly full, the rest spilled or dropped.
        let bufs: Vec<ScratchBuf> = (0..LOCAL_CAP + 2)
            .map(|i| {
                let mut buf = ScratchBuf::take();
                buf.push(i as u64);
                buf
            })
            .collect();
        drop(bufs);
        LOCAL.with(|local| assert_eq!(local.borrow().len(), LOCAL_CAP));

        // Another thread, with an empty local cache, can pick one up.
        std::thread::spawn(|| {
            let buf = ScratchBuf::take();
            assert!(buf.is_empty());
        })
        .join()
        .unwrap();
    }
}
