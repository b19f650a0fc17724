//! The five-band aged MPMC request queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nohash_hasher::IntSet;
use parking_lot::{Condvar, Mutex};
use web_time::Instant;

use hl_core::{ExecMode, Priority};

/// How long a blocked consumer sleeps between wake checks. Bounded so that
/// aging keeps running and shutdown is never stuck behind a wait.
const CONSUMER_WAIT: Duration = Duration::from_millis(100);

/// A queued translation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejitRequest {
    pub address: u64,
    pub mode: ExecMode,
    pub priority: Priority,

    /// Monotonic millisecond tick of the *original* enqueue. Deliberately
    /// not refreshed on promotion, so one aging pass can cascade a starved
    /// request through several bands at once.
    pub enqueued_tick: u64,

    /// How many bands this request has climbed through aging or boosting.
    pub promotions: u8,
}

/// Pending requests per band, most urgent first.
pub type QueueDepths = [usize; Priority::NUM_BANDS];

struct Inner {
    bands: [VecDeque<RejitRequest>; Priority::NUM_BANDS],

    /// Addresses currently queued; at most one live request per address.
    pending: IntSet<u64>,
}

impl Inner {
    fn total(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }
}

/// Multi-producer/multi-consumer queue with five FIFO bands, an address
/// dedup set, and age-based promotion.
///
/// Intra-band service order is LIFO: hot code arrives in bursts and the
/// newest request is the most likely to be executed next.
pub struct RejitQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    open: AtomicBool,

    age_unit_ms: u64,
    epoch: Instant,

    /// Test seam: overrides the monotonic tick when set.
    tick_override: Option<Arc<dyn Fn() -> u64 + Send + Sync>>,
}

impl RejitQueue {
    pub fn new(age_unit_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bands: Default::default(),
                pending: IntSet::default(),
            }),
            available: Condvar::new(),
            open: AtomicBool::new(true),
            age_unit_ms,
            epoch: Instant::now(),
            tick_override: None,
        }
    }

    /// A queue driven by an external tick source instead of the wall clock.
    pub fn with_tick(age_unit_ms: u64, tick: Arc<dyn Fn() -> u64 + Send + Sync>) -> Self {
        Self {
            tick_override: Some(tick),
            ..Self::new(age_unit_ms)
        }
    }

    fn now_ms(&self) -> u64 {
        match &self.tick_override {
            Some(tick) => tick(),
            None => self.epoch.elapsed().as_millis() as u64,
        }
    }

    /// Queues `address` at `priority` unless it is already pending or the
    /// queue is closed. Returns whether the request was accepted.
    pub fn enqueue(&self, address: u64, mode: ExecMode, priority: Priority) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut inner = self.inner.lock();
            if !inner.pending.insert(address) {
                hl_log::trace!("duplicate enqueue of {address:#x} dropped");
                return false;
            }
            inner.bands[priority.band()].push_back(RejitRequest {
                address,
                mode,
                priority,
                enqueued_tick: self.now_ms(),
                promotions: 0,
            });
        }
        self.available.notify_one();
        true
    }

    /// Dequeues the most urgent request. With `blocking`, parks (in bounded
    /// slices) until a request arrives or the queue closes.
    pub fn try_dequeue(&self, blocking: bool) -> Option<RejitRequest> {
        let mut guard = self.inner.lock();
        loop {
            let inner = &mut *guard;
            self.promote_aged_locked(inner);
            for band in &mut inner.bands {
                if let Some(request) = band.pop_back() {
                    inner.pending.remove(&request.address);
                    return Some(request);
                }
            }
            if !blocking || !self.open.load(Ordering::Acquire) {
                return None;
            }
            let _ = self.available.wait_for(&mut guard, CONSUMER_WAIT);
        }
    }

    /// Drains up to `max` requests into `out`, most urgent bands first,
    /// without blocking. Returns how many were taken.
    pub fn try_dequeue_batch(&self, max: usize, out: &mut Vec<RejitRequest>) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.promote_aged_locked(inner);
        let mut taken = 0;
        for band in &mut inner.bands {
            while taken < max {
                let Some(request) = band.pop_back() else { break };
                inner.pending.remove(&request.address);
                out.push(request);
                taken += 1;
            }
            if taken == max {
                break;
            }
        }
        taken
    }

    /// Like [`Self::try_dequeue_batch`], but first waits up to `timeout` for
    /// work to arrive (or the queue to close).
    pub fn dequeue_batch_timeout(
        &self,
        max: usize,
        timeout: Duration,
        out: &mut Vec<RejitRequest>,
    ) -> usize {
        {
            let mut inner = self.inner.lock();
            if inner.total() == 0 && self.open.load(Ordering::Acquire) {
                let _ = self.available.wait_for(&mut inner, timeout);
            }
        }
        self.try_dequeue_batch(max, out)
    }

    /// Yanks `address` out of whatever sub-critical band it sits in and
    /// re-queues it as critical (e.g. the executor is now stalled on it).
    pub fn boost(&self, address: u64) -> bool {
        let mut inner = self.inner.lock();
        for band in 1..Priority::NUM_BANDS {
            let Some(index) = inner.bands[band].iter().position(|r| r.address == address) else {
                continue;
            };
            let mut request = inner.bands[band]
                .remove(index)
                .expect("position() said it is there");
            request.priority = Priority::Critical;
            request.promotions += 1;
            inner.bands[Priority::Critical.band()].push_back(request);
            drop(inner);
            self.available.notify_one();
            return true;
        }
        false
    }

    /// Promotes every request that has waited longer than its band allows.
    ///
    /// Band `p` tolerates `age_unit * (p + 1)` ms. Bands are scanned from
    /// the least urgent up, and promoted requests keep their original
    /// enqueue tick, so a request starved for long enough cascades all the
    /// way to critical in a single pass. The worst-case wait before a
    /// request becomes critical is the background band's own threshold.
    fn promote_aged_locked(&self, inner: &mut Inner) {
        let now = self.now_ms();
        for band in (1..Priority::NUM_BANDS).rev() {
            let threshold = self.age_unit_ms * (band as u64 + 1);
            let mut index = 0;
            while index < inner.bands[band].len() {
                let age = now.saturating_sub(inner.bands[band][index].enqueued_tick);
                if age > threshold {
                    let mut request = inner.bands[band]
                        .remove(index)
                        .expect("index bounded by len");
                    request.priority =
                        Priority::from_band(band - 1).expect("band 1..=4 promotes to 0..=3");
                    request.promotions += 1;
                    inner.bands[band - 1].push_back(request);
                } else {
                    index += 1;
                }
            }
        }
    }

    /// How many requests are pending, in total.
    pub fn len(&self) -> usize {
        self.inner.lock().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending requests per band (inspection/telemetry).
    pub fn depths(&self) -> QueueDepths {
        let inner = self.inner.lock();
        std::array::from_fn(|band| inner.bands[band].len())
    }

    /// Which band `address` currently waits in, if any.
    pub fn band_of(&self, address: u64) -> Option<Priority> {
        let inner = self.inner.lock();
        for (band, requests) in inner.bands.iter().enumerate() {
            if requests.iter().any(|r| r.address == address) {
                return Priority::from_band(band);
            }
        }
        None
    }

    /// Drops everything that is pending.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for band in &mut inner.bands {
            band.clear();
        }
        inner.pending.clear();
    }

    /// Stops accepting work and wakes every blocked consumer. Pending
    /// requests stay queued (and counted) so callers can report them.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
