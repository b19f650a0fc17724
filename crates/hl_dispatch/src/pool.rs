//! Worker threads draining the request queue in batches.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use web_time::Instant;

use hl_cache::TranslationCache;
use hl_core::Compiler;

use crate::RejitQueue;

/// How many requests a worker takes per wakeup.
const BATCH_SIZE: usize = 8;

/// Bounded wait per wakeup; keeps shutdown latency under control.
const WORKER_WAIT: Duration = Duration::from_millis(100);

/// How long `shutdown` waits for workers before abandoning them.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Called after a successful compile so the speculative tracer can queue
/// the produced function's successors.
pub type TranslatedHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Counters {
    compiled: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

/// Lifetime counters of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub compiled: u64,

    /// Requests dropped because the producer returned an error. Never
    /// retried: the dedup set would otherwise let a poisoned address
    /// livelock the pool.
    pub failed: u64,

    /// Requests dropped because the producer panicked.
    pub panicked: u64,
}

/// `W` threads draining the [`RejitQueue`] in batches and registering the
/// produced artifacts with the translation cache.
///
/// Producer failures are swallowed and counted; the pool always prefers
/// forward progress over completeness. The demand path does its own
/// synchronous compile on the next miss, so a dropped request costs one
/// hitch, not a crash.
pub struct WorkerPool<A> {
    queue: Arc<RejitQueue>,
    counters: Arc<Counters>,
    exited: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,

    _artifact: std::marker::PhantomData<fn() -> A>,
}

impl<A: Clone + Send + Sync + 'static> WorkerPool<A> {
    pub fn spawn(
        worker_count: usize,
        queue: Arc<RejitQueue>,
        cache: Arc<TranslationCache<A>>,
        compiler: Arc<dyn Compiler<A>>,
        on_translated: Option<TranslatedHook>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let counters = Arc::new(Counters::default());
        let exited = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count)
            .map(|index| {
                let queue = Arc::clone(&queue);
                let cache = Arc::clone(&cache);
                let compiler = Arc::clone(&compiler);
                let on_translated = on_translated.clone();
                let counters = Arc::clone(&counters);
                let exited = Arc::clone(&exited);
                std::thread::Builder::new()
                    .name(format!("hl-worker-{index}"))
                    .spawn(move || {
                        worker_loop(&queue, &cache, &*compiler, on_translated.as_deref(), &counters);
                        exited.fetch_add(1, Ordering::Release);
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        hl_log::debug!("translation worker pool started ({worker_count} workers)");
        Self {
            queue,
            counters,
            exited,
            workers: Mutex::new(workers),
            worker_count,
            _artifact: std::marker::PhantomData,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            compiled: self.counters.compiled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Closes the queue, then joins each worker within a shared one-second
    /// budget. Workers that still have not wound down (a wedged external
    /// producer) are abandoned with daemon semantics.
    pub fn shutdown(&self) {
        self.queue.close();

        let deadline = Instant::now() + JOIN_TIMEOUT;
        while self.exited.load(Ordering::Acquire) < self.worker_count
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut workers = self.workers.lock();
        if self.exited.load(Ordering::Acquire) == self.worker_count {
            for worker in workers.drain(..) {
                worker.join().ok();
            }
        } else {
            let abandoned = self.worker_count - self.exited.load(Ordering::Acquire);
            hl_log::warn!("abandoning {abandoned} unresponsive worker(s) at shutdown");
            workers.clear();
        }
    }
}

impl<A> Drop for WorkerPool<A> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

fn worker_loop<A: Clone>(
    queue: &RejitQueue,
    cache: &TranslationCache<A>,
    compiler: &dyn Compiler<A>,
    on_translated: Option<&(dyn Fn(u64) + Send + Sync)>,
    counters: &Counters,
) {
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    loop {
        batch.clear();
        if queue.dequeue_batch_timeout(BATCH_SIZE, WORKER_WAIT, &mut batch) == 0 {
            if queue.is_closed() {
                return;
            }
            continue;
        }

        for request in batch.drain(..) {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                compiler.compile(request.address, request.mode)
            }));
            match outcome {
                Ok(Ok(translated)) => {
                    debug_assert!(translated.size > 0);
                    cache.get_or_add(request.address, translated.size, translated.artifact);
                    counters.compiled.fetch_add(1, Ordering::Relaxed);
                    if let Some(hook) = on_translated {
                        hook(request.address);
                    }
                }
                Ok(Err(err)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    hl_log::warn!("compile of {:#x} failed: {err}", request.address);
                }
                Err(_panic) => {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    hl_log::warn!("compiler panicked on {:#x}; request dropped", request.address);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use hl_core::{CompileError, ExecMode, Priority, Translated};

    use super::*;

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    fn scripted(
        f: impl Fn(u64, ExecMode) -> Result<Translated<u64>, CompileError> + Send + Sync + 'static,
    ) -> Arc<dyn Compiler<u64>> {
        Arc::new(f)
    }

    #[test]
    fn workers_drain_the_queue_into_the_cache() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::<u64>::new(256));
        let compiler = scripted(|addr, _mode| {
            Ok(Translated {
                artifact: addr ^ 0xFF,
                size: 16,
            })
        });

        let pool = WorkerPool::spawn(
            2,
            Arc::clone(&queue),
            Arc::clone(&cache),
            compiler,
            None,
        );

        for i in 0..64u64 {
            assert!(queue.enqueue(0x4000 + i * 32, ExecMode::Baseline, Priority::Normal));
        }
        assert!(
            wait_until(2000, || cache.count() == 64),
            "only {} of 64 translated",
            cache.count()
        );
        assert_eq!(cache.try_get(0x4000), Some(0x4000 ^ 0xFF));
        assert_eq!(pool.stats().compiled, 64);
        pool.shutdown();
    }

    #[test]
    fn failures_are_counted_not_retried() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::<u64>::new(256));
        let attempts = Arc::new(AtomicU64::new(0));
        let compiler = {
            let attempts = Arc::clone(&attempts);
            scripted(move |addr, _mode| {
                attempts.fetch_add(1, Ordering::Relaxed);
                if addr == 0xBAD {
                    Err(CompileError::Failed {
                        addr,
                        reason: "unsupported opcode".to_owned(),
                    })
                } else {
                    Ok(Translated {
                        artifact: addr,
                        size: 4,
                    })
                }
            })
        };

        let pool = WorkerPool::spawn(1, Arc::clone(&queue), Arc::clone(&cache), compiler, None);
        queue.enqueue(0xBAD, ExecMode::Baseline, Priority::Critical);
        queue.enqueue(0x1000, ExecMode::Baseline, Priority::Critical);

        assert!(wait_until(2000, || pool.stats().failed == 1
            && pool.stats().compiled == 1));
        assert_eq!(cache.try_get(0xBAD), None);
        assert_eq!(attempts.load(Ordering::Relaxed), 2, "no retry of the failure");
        pool.shutdown();
    }

    #[test]
    fn panicking_producer_does_not_kill_the_worker() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::<u64>::new(256));
        let compiler = scripted(|addr, _mode| {
            assert!(addr != 0xDEAD, "scripted panic");
            Ok(Translated {
                artifact: addr,
                size: 4,
            })
        });

        let pool = WorkerPool::spawn(1, Arc::clone(&queue), Arc::clone(&cache), compiler, None);
        queue.enqueue(0xDEAD, ExecMode::Baseline, Priority::Critical);
        queue.enqueue(0x2000, ExecMode::Baseline, Priority::Critical);

        // The same worker survives the panic and still compiles 0x2000.
        assert!(wait_until(2000, || pool.stats().panicked == 1
            && pool.stats().compiled == 1));
        assert_eq!(cache.try_get(0x2000), Some(0x2000));
        pool.shutdown();
    }

    #[test]
    fn shutdown_with_a_loaded_queue_returns_promptly() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::<u64>::new(4096));
        let compiler = scripted(|addr, _mode| {
            Ok(Translated {
                artifact: addr,
                size: 4,
            })
        });

        let pool = WorkerPool::spawn(2, Arc::clone(&queue), Arc::clone(&cache), compiler, None);
        for i in 0..1000u64 {
            queue.enqueue(0x10_0000 + i * 4, ExecMode::Baseline, Priority::Background);
        }

        let begin = Instant::now();
        pool.shutdown();
        assert!(
            begin.elapsed() < WORKER_WAIT + Duration::from_millis(1100),
            "shutdown took {:?}",
            begin.elapsed()
        );

        // Whatever was not drained is still reported, and producers are
        // refused from now on.
        let _pending = queue.len();
        assert!(!queue.enqueue(0x42, ExecMode::Baseline, Priority::Critical));
    }

    #[test]
    fn on_translated_hook_fires_per_artifact() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::<u64>::new(256));
        let compiler = scripted(|addr, _mode| {
            Ok(Translated {
                artifact: addr,
                size: 4,
            })
        });
        let notified = Arc::new(AtomicU64::new(0));
        let hook: TranslatedHook = {
            let notified = Arc::clone(&notified);
            Arc::new(move |_addr| {
                notified.fetch_add(1, Ordering::Relaxed);
            })
        };

        let pool = WorkerPool::spawn(
            2,
            Arc::clone(&queue),
            Arc::clone(&cache),
            compiler,
            Some(hook),
        );
        for i in 0..16u64 {
            queue.enqueue(0x8000 + i * 4, ExecMode::Baseline, Priority::High);
        }
        assert!(wait_until(2000, || notified.load(Ordering::Relaxed) == 16));
        pool.shutdown();
    }
}
