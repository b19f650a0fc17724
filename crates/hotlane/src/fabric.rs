//! The context that owns every component and wires them together.

use std::sync::Arc;

use hl_cache::{CacheStats, TranslationCache};
use hl_core::{CompileError, Compiler, ExecMode, FabricConfig, GuestMemory, Priority};
use hl_dispatch::{PoolStats, RejitQueue, TranslatedHook, WorkerPool};
use hl_pacing::{FrameController, SchedulerStats, WorkPriority, WorkScheduler};
use hl_speculate::{SpecStats, SpeculativeTracer};
use hl_util::align_up;

/// Page granularity assumed when the prewarm scan skips unmapped holes.
const PREWARM_PAGE: u64 = 4096;

/// One stats snapshot across every component.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FabricStats {
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub speculation: SpecStats,
    pub scheduler: SchedulerStats,
    pub queued_requests: usize,
}

/// Owns all components of the fabric (arena-of-handles: everything holds
/// `Arc`s downward, so there are no reference cycles to break).
///
/// `A` is the opaque artifact type the external compiler produces.
pub struct Fabric<A> {
    cache: Arc<TranslationCache<A>>,
    queue: Arc<RejitQueue>,
    pool: WorkerPool<A>,
    tracer: Arc<SpeculativeTracer<A>>,
    controller: Arc<FrameController>,
    scheduler: Arc<WorkScheduler>,
    compiler: Arc<dyn Compiler<A>>,
}

impl<A: Clone + Send + Sync + 'static> Fabric<A> {
    pub fn new(config: &FabricConfig, compiler: Arc<dyn Compiler<A>>) -> Self {
        let controller = Arc::new(FrameController::new(config));
        Self::with_controller(config, compiler, controller)
    }

    /// Like [`Self::new`] but with a caller-supplied controller, the seam
    /// tests use to drive the frame clock by hand.
    pub fn with_controller(
        config: &FabricConfig,
        compiler: Arc<dyn Compiler<A>>,
        controller: Arc<FrameController>,
    ) -> Self {
        let cache = Arc::new(TranslationCache::new(config.hot_cache_cap));
        let queue = Arc::new(RejitQueue::new(config.age_unit_ms));
        let scheduler = WorkScheduler::spawn(Arc::clone(&controller));
        let tracer = Arc::new(SpeculativeTracer::spawn(
            config,
            Arc::clone(&cache),
            Arc::clone(&compiler),
        ));

        let on_translated: TranslatedHook = {
            let tracer = Arc::clone(&tracer);
            Arc::new(move |addr: u64| tracer.notify_translated(addr))
        };
        let pool = WorkerPool::spawn(
            config.effective_worker_count(),
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&compiler),
            Some(on_translated),
        );

        hl_log::info!(
            "fabric up: {} workers, hot cache cap {}",
            pool.worker_count(),
            config.hot_cache_cap
        );

        Self {
            cache,
            queue,
            pool,
            tracer,
            controller,
            scheduler,
            compiler,
        }
    }

    // --- Executor surface ---

    /// The hot-path lookup.
    #[inline]
    pub fn try_get(&self, addr: u64) -> Option<A> {
        self.cache.try_get(addr)
    }

    /// Demand translate: the executor is stalled on `addr`, so compile
    /// synchronously (unless someone beat us to it) and register the result.
    ///
    /// This is the only path that surfaces producer failures to the caller.
    pub fn translate_now(&self, addr: u64, mode: ExecMode) -> Result<A, CompileError> {
        if let Some(artifact) = self.cache.try_get(addr) {
            return Ok(artifact);
        }
        let translated = self.compiler.compile(addr, mode)?;
        Ok(self
            .cache
            .get_or_add(addr, translated.size, translated.artifact))
    }

    /// Queues a background translation. Returns `false` if the address is
    /// already cached, already queued, or the fabric is shutting down.
    pub fn request_translation(&self, addr: u64, mode: ExecMode, priority: Priority) -> bool {
        if self.cache.contains_key(addr) {
            return false;
        }
        self.queue.enqueue(addr, mode, priority)
    }

    /// Escalates a queued request to critical (the executor is now waiting
    /// on it).
    pub fn boost(&self, addr: u64) -> bool {
        self.queue.boost(addr)
    }

    // --- Executor hooks (pushed into the tracer) ---

    #[inline]
    pub fn on_execute(&self, addr: u64) {
        self.tracer.record_execution(addr);
    }

    #[inline]
    pub fn on_branch(&self, src: u64, tgt: u64) {
        self.tracer.record_branch(src, tgt);
    }

    #[inline]
    pub fn on_call(&self, caller: u64, callee: u64) {
        self.tracer.record_call(caller, callee);
    }

    // --- Render-thread surface ---

    #[inline]
    pub fn record_shader(&self) {
        self.controller.record_shader();
    }

    #[inline]
    pub fn record_texture(&self) {
        self.controller.record_texture();
    }

    #[inline]
    pub fn record_buffer_upload(&self) {
        self.controller.record_buffer_upload();
    }

    /// Frame boundary: advance the pacing state machine, then spend what is
    /// left of this frame's budget on deferred work.
    pub fn end_frame(&self) {
        self.controller.end_frame();
        self.scheduler.process_deferred();
    }

    /// Gates an opportunistic work item through the deferral logic.
    pub fn schedule(&self, priority: WorkPriority, work: impl FnOnce() + Send + 'static) -> bool {
        self.scheduler.schedule(priority, work)
    }

    // --- Bulk prewarm ---

    /// Scans `[start, end)` for translation candidates and queues them at
    /// background priority.
    ///
    /// The heuristic is ISA-agnostic: runs of nonzero words separated by
    /// zero padding (or page holes) look like functions, and each run head
    /// is a candidate entry point. Returns how many requests were queued.
    pub fn prewarm_range(
        &self,
        start: u64,
        end: u64,
        mode: ExecMode,
        memory: &dyn GuestMemory,
    ) -> usize {
        let mut queued = 0;
        let mut addr = align_up(start, 4);
        let mut at_boundary = true;
        while addr.saturating_add(4) <= end {
            if !memory.is_mapped(addr) {
                addr = align_up(addr + 1, PREWARM_PAGE);
                at_boundary = true;
                continue;
            }
            let word = memory.read_u32(addr);
            if word != 0 && at_boundary && !self.cache.contains_key(addr) {
                if self.queue.enqueue(addr, mode, Priority::Background) {
                    queued += 1;
                }
            }
            at_boundary = word == 0;
            addr += 4;
        }
        hl_log::debug!("prewarm scan of [{start:#x}, {end:#x}) queued {queued} candidate(s)");
        queued
    }

    // --- Invalidation & lifecycle ---

    /// Drops the translation starting at exactly `addr`.
    pub fn invalidate(&self, addr: u64) -> bool {
        self.cache.remove(addr)
    }

    /// Drops every translation intersecting `[start, start + size)`: the
    /// guest unmapped or rewrote that memory.
    pub fn invalidate_range(&self, start: u64, size: u64) -> u32 {
        self.cache.remove_overlapping(start, size)
    }

    /// ROM switch: forget all artifacts, learned graphs and pacing history.
    /// The fabric stays running.
    pub fn clear(&self) {
        self.queue.clear();
        self.tracer.clear();
        self.cache.clear();
        self.controller.reset();
    }

    /// Orderly shutdown: stop producers, drain workers (bounded), join
    /// helper threads.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.tracer.shutdown();
        self.scheduler.shutdown();
        hl_log::info!("fabric down: {} request(s) left queued", self.queue.len());
    }

    // --- Component handles ---

    pub fn cache(&self) -> &Arc<TranslationCache<A>> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<RejitQueue> {
        &self.queue
    }

    pub fn controller(&self) -> &Arc<FrameController> {
        &self.controller
    }

    pub fn scheduler(&self) -> &Arc<WorkScheduler> {
        &self.scheduler
    }

    pub fn tracer(&self) -> &Arc<SpeculativeTracer<A>> {
        &self.tracer
    }

    pub fn stats(&self) -> FabricStats {
        FabricStats {
            cache: self.cache.stats(),
            pool: self.pool.stats(),
            speculation: self.tracer.stats(),
            scheduler: self.scheduler.stats(),
            queued_requests: self.queue.len(),
        }
    }
}
