//! Speculative translation: watch what the guest executes, learn its
//! branch/call graph, and compile the likely-next functions before the
//! executor asks for them.
//!
//! Everything here is opportunistic. Every enqueue can be dropped (queue
//! full, depth cap, already cached, already queued) and every compile
//! failure is swallowed; the demand path remains the only place where a
//! missing artifact is ever surfaced to a caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nohash_hasher::{IntMap, IntSet};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use hl_cache::TranslationCache;
use hl_core::{Compiler, ExecMode, FabricConfig};
use hl_util::ScratchBuf;

/// Bound on remembered branch targets per source address. Indirect branches
/// that fan out wider than this keep their first eight observed targets.
const MAX_TARGETS: usize = 8;

/// Worker wake interval when idle.
const WORKER_WAIT: Duration = Duration::from_millis(100);

type TargetSet = SmallVec<[u64; MAX_TARGETS]>;

struct PendingState {
    /// `(address, depth)` FIFO of speculation candidates.
    queue: VecDeque<(u64, u8)>,

    /// Addresses currently queued; at most one pending entry per address.
    in_flight: IntSet<u64>,
}

struct Shared<A> {
    cache: Arc<TranslationCache<A>>,
    compiler: Arc<dyn Compiler<A>>,

    exec_counts: Mutex<IntMap<u64, u32>>,
    branch_targets: Mutex<IntMap<u64, TargetSet>>,
    pending: Mutex<PendingState>,
    wake: Condvar,

    /// Tracked queue length, so admission never has to lock and count.
    queued_len: AtomicUsize,
    running: AtomicBool,

    spec_threshold: u32,
    max_depth: u8,
    queue_cap: usize,

    queued: AtomicU64,
    dropped_full: AtomicU64,
    dropped_depth: AtomicU64,
    dropped_dup: AtomicU64,
    cache_hits: AtomicU64,
    compiled: AtomicU64,
    failed: AtomicU64,
}

/// Lifetime counters of a [`SpeculativeTracer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpecStats {
    pub queued: u64,
    pub dropped_full: u64,
    pub dropped_depth: u64,
    pub dropped_dup: u64,

    /// Candidates skipped because the cache already had them.
    pub cache_hits: u64,
    pub compiled: u64,
    pub failed: u64,
}

/// The speculative producer: exec-count and branch-target maps fed by the
/// executor, a bounded candidate queue, and one low-priority worker thread
/// draining it through the external compiler.
pub struct SpeculativeTracer<A> {
    shared: Arc<Shared<A>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Clone + Send + Sync + 'static> SpeculativeTracer<A> {
    pub fn spawn(
        config: &FabricConfig,
        cache: Arc<TranslationCache<A>>,
        compiler: Arc<dyn Compiler<A>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            cache,
            compiler,
            exec_counts: Mutex::new(IntMap::default()),
            branch_targets: Mutex::new(IntMap::default()),
            pending: Mutex::new(PendingState {
                queue: VecDeque::new(),
                in_flight: IntSet::default(),
            }),
            wake: Condvar::new(),
            queued_len: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            spec_threshold: config.spec_threshold,
            max_depth: config.max_spec_depth,
            queue_cap: config.queue_max_size,
            queued: AtomicU64::new(0),
            dropped_full: AtomicU64::new(0),
            dropped_depth: AtomicU64::new(0),
            dropped_dup: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            compiled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("hl-speculate".to_owned())
                .spawn(move || shared.worker_loop())
                .expect("failed to spawn speculative worker")
        };

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Executor hook: `addr` started executing.
    ///
    /// The first time its execution count crosses the speculation threshold,
    /// every branch target recorded for it so far is queued.
    pub fn record_execution(&self, addr: u64) {
        let count = {
            let mut counts = self.shared.exec_counts.lock();
            let count = counts.entry(addr).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if count == self.shared.spec_threshold {
            self.shared.enqueue_known_targets(addr, 0);
        }
    }

    /// Executor hook: a branch from `src` to `tgt` was taken.
    pub fn record_branch(&self, src: u64, tgt: u64) {
        {
            let mut targets = self.shared.branch_targets.lock();
            let entry = targets.entry(src).or_default();
            if !entry.contains(&tgt) && entry.len() < MAX_TARGETS {
                entry.push(tgt);
            }
        }
        let armed = self
            .shared
            .exec_counts
            .lock()
            .get(&src)
            .is_some_and(|count| *count >= self.shared.spec_threshold);
        if armed {
            self.shared.enqueue_speculative(tgt, 0);
        }
    }

    /// Executor hook: a call from `caller` to `callee`. Calls are strong
    /// signals, so the callee is queued unconditionally.
    pub fn record_call(&self, _caller: u64, callee: u64) {
        self.shared.enqueue_speculative(callee, 0);
    }

    /// Worker-pool hook: `addr` was just translated on the demand side;
    /// queue its known successors.
    pub fn notify_translated(&self, addr: u64) {
        self.shared.enqueue_known_targets(addr, 0);
    }

    /// How many candidates are waiting right now.
    pub fn pending_len(&self) -> usize {
        self.shared.queued_len.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SpecStats {
        let shared = &self.shared;
        SpecStats {
            queued: shared.queued.load(Ordering::Relaxed),
            dropped_full: shared.dropped_full.load(Ordering::Relaxed),
            dropped_depth: shared.dropped_depth.load(Ordering::Relaxed),
            dropped_dup: shared.dropped_dup.load(Ordering::Relaxed),
            cache_hits: shared.cache_hits.load(Ordering::Relaxed),
            compiled: shared.compiled.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Forgets everything learned about the current workload (ROM switch).
    pub fn clear(&self) {
        self.shared.exec_counts.lock().clear();
        self.shared.branch_targets.lock().clear();
        let mut pending = self.shared.pending.lock();
        pending.queue.clear();
        pending.in_flight.clear();
        self.shared.queued_len.store(0, Ordering::Relaxed);
    }

    /// Stops the worker and joins it.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            worker.join().ok();
        }
    }
}

impl<A> Drop for SpeculativeTracer<A> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_all();
    }
}

impl<A: Clone + Send + Sync + 'static> Shared<A> {
    /// Queues every recorded branch target of `addr` at `depth`.
    fn enqueue_known_targets(&self, addr: u64, depth: u8) {
        let mut successors = ScratchBuf::take();
        if let Some(targets) = self.branch_targets.lock().get(&addr) {
            successors.extend_from_slice(targets);
        }
        for &tgt in successors.iter() {
            self.enqueue_speculative(tgt, depth);
        }
    }

    /// Admission rule for one speculation candidate. Every rejection is
    /// silent (counted only): speculation must never push back on the
    /// executor.
    fn enqueue_speculative(&self, addr: u64, depth: u8) -> bool {
        if depth >= self.max_depth {
            self.dropped_depth.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.queued_len.load(Ordering::Relaxed) >= self.queue_cap {
            self.dropped_full.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.cache.contains_key(addr) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        {
            let mut pending = self.pending.lock();
            if !pending.in_flight.insert(addr) {
                self.dropped_dup.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            pending.queue.push_back((addr, depth));
        }
        self.queued_len.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
        true
    }

    fn worker_loop(&self) {
        hl_log::debug!("speculative worker started");
        loop {
            let item = {
                let mut pending = self.pending.lock();
                if pending.queue.is_empty() {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = self.wake.wait_for(&mut pending, WORKER_WAIT);
                }
                match pending.queue.pop_front() {
                    Some((addr, depth)) => {
                        pending.in_flight.remove(&addr);
                        Some((addr, depth))
                    }
                    None => None,
                }
            };
            let Some((addr, depth)) = item else {
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
                continue;
            };
            self.queued_len.fetch_sub(1, Ordering::Relaxed);

            if self.cache.contains_key(addr) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            } else {
                match self.compiler.compile(addr, ExecMode::Baseline) {
                    Ok(translated) => {
                        self.cache.get_or_add(addr, translated.size, translated.artifact);
                        self.compiled.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        // Opportunistic path: swallow and count.
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        hl_log::trace!("speculative compile of {addr:#x} failed: {err}");
                    }
                }
            }

            self.enqueue_known_targets(addr, depth.saturating_add(1));
        }
    }
}

// ----------------------------------------------------------------------------
