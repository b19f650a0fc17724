//! The deferral gate in front of every opportunistic producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use web_time::Instant;

use crate::{FrameController, TransitionState};

/// Wall-clock budget of one frame-boundary drain.
const DRAIN_BUDGET: Duration = Duration::from_millis(8);

/// Pause between background items, yielding the core to realtime threads.
const BACKGROUND_PACE: Duration = Duration::from_millis(1);

/// Urgency of one scheduled work item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum WorkPriority {
    /// Drained by the background thread when the frame pipeline is calm.
    Low = 0,

    /// Drained at frame boundaries within the per-frame budget.
    Normal = 1,

    /// Runs immediately, always; only counted against the frame budget.
    Critical = 2,
}

type Work = Box<dyn FnOnce() + Send>;

/// Lifetime counters of a [`WorkScheduler`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ran_inline: u64,
    pub deferred: u64,
    pub drained: u64,
    pub drained_background: u64,
    pub dropped_on_shutdown: u64,
}

/// Admission control for opportunistic work (texture prefetch, speculative
/// translation, shader warmup).
///
/// Consults the [`FrameController`] per item: run now, queue for the
/// frame-boundary drain, or leave for the background thread. Critical work
/// always runs immediately and is merely counted against the frame budget.
pub struct WorkScheduler {
    controller: Arc<FrameController>,
    bands: Mutex<[VecDeque<Work>; 3]>,

    work_this_frame: AtomicU32,
    external_pressure: AtomicBool,
    running: AtomicBool,

    ran_inline: AtomicU64,
    deferred: AtomicU64,
    drained: AtomicU64,
    drained_background: AtomicU64,
    dropped_on_shutdown: AtomicU64,

    shutdown_tx: Mutex<Option<Sender<()>>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl WorkScheduler {
    /// Creates the scheduler and its background drain thread.
    pub fn spawn(controller: Arc<FrameController>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let scheduler = Arc::new(Self {
            controller,
            bands: Mutex::new(Default::default()),
            work_this_frame: AtomicU32::new(0),
            external_pressure: AtomicBool::new(false),
            running: AtomicBool::new(true),
            ran_inline: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            drained_background: AtomicU64::new(0),
            dropped_on_shutdown: AtomicU64::new(0),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            background: Mutex::new(None),
        });

        let thread = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::Builder::new()
                .name("hl-deferred".to_owned())
                .spawn(move || scheduler.background_loop(&shutdown_rx))
                .expect("failed to spawn deferred-work thread")
        };
        *scheduler.background.lock() = Some(thread);
        scheduler
    }

    /// Admits `work` now or queues it, per the controller's current state.
    /// Returns whether the work ran inline.
    pub fn schedule(&self, priority: WorkPriority, work: impl FnOnce() + Send + 'static) -> bool {
        if !self.running.load(Ordering::Acquire) {
            self.dropped_on_shutdown.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if priority == WorkPriority::Critical {
            self.work_this_frame.fetch_add(1, Ordering::Relaxed);
            self.ran_inline.fetch_add(1, Ordering::Relaxed);
            work();
            return true;
        }

        let controller = &self.controller;
        let throttled = controller.in_transition()
            || controller.state() == TransitionState::Grace
            || controller.heavy_load()
            || self.external_pressure.load(Ordering::Acquire);

        if !throttled
            && self.work_this_frame.load(Ordering::Relaxed) < controller.max_work_items_this_frame()
        {
            self.work_this_frame.fetch_add(1, Ordering::Relaxed);
            self.ran_inline.fetch_add(1, Ordering::Relaxed);
            work();
            return true;
        }

        self.bands.lock()[priority as usize].push_back(Box::new(work));
        self.deferred.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Frame-boundary drain: runs deferred work, most urgent first, until
    /// the controller's per-frame budget or an 8 ms wall-clock slice is
    /// spent. Also opens the next frame's inline budget.
    ///
    /// Call once per frame, right after `end_frame`.
    pub fn process_deferred(&self) -> usize {
        self.work_this_frame.store(0, Ordering::Relaxed);

        let budget = self.controller.max_work_items_this_frame();
        let started = Instant::now();
        let mut ran = 0;

        while self.work_this_frame.load(Ordering::Relaxed) < budget
            && started.elapsed() < DRAIN_BUDGET
        {
            let Some(work) = self.pop_most_urgent() else { break };
            self.work_this_frame.fetch_add(1, Ordering::Relaxed);
            work();
            ran += 1;
            self.drained.fetch_add(1, Ordering::Relaxed);
        }
        ran
    }

    /// A host-side signal (e.g. the guest is mid-loading-screen on the IO
    /// path) that forces sub-critical work to queue.
    pub fn set_external_pressure(&self, pressure: bool) {
        self.external_pressure.store(pressure, Ordering::Release);
    }

    /// Deferred items currently queued, all bands.
    pub fn pending_len(&self) -> usize {
        self.bands.lock().iter().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ran_inline: self.ran_inline.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            drained_background: self.drained_background.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
        }
    }

    /// Stops admitting work, drops what is queued, joins the background
    /// thread.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        // Dropping the sender disconnects the channel and wakes the thread.
        self.shutdown_tx.lock().take();
        if let Some(thread) = self.background.lock().take() {
            thread.join().ok();
        }
        let dropped: usize = {
            let mut bands = self.bands.lock();
            bands.iter_mut().map(|band| std::mem::take(band).len()).sum()
        };
        if dropped > 0 {
            hl_log::debug!("dropped {dropped} deferred work item(s) at shutdown");
            self.dropped_on_shutdown.fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    fn pop_most_urgent(&self) -> Option<Work> {
        let mut bands = self.bands.lock();
        for band in bands.iter_mut().rev() {
            if let Some(work) = band.pop_front() {
                return Some(work);
            }
        }
        None
    }

    /// The background thread: drains only the Low band, only when the frame
    /// pipeline is calm, pacing itself between items.
    fn background_loop(&self, shutdown_rx: &Receiver<()>) {
        loop {
            match shutdown_rx.recv_timeout(BACKGROUND_PACE) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.controller.in_transition() || self.controller.heavy_load() {
                continue;
            }
            let work = self.bands.lock()[WorkPriority::Low as usize].pop_front();
            if let Some(work) = work {
                work();
                self.drained_background.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use hl_core::FabricConfig;

    use super::*;
    use crate::ManualClock;

    struct Rig {
        clock: Arc<ManualClock>,
        controller: Arc<FrameController>,
        scheduler: Arc<WorkScheduler>,
        counter: Arc<AtomicUsize>,
    }

    impl Rig {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let clock_handle: Arc<dyn crate::FrameClock> = clock.clone() as Arc<dyn crate::FrameClock>;
            let controller = Arc::new(FrameController::with_clock(
                &FabricConfig::DEFAULT,
                clock_handle,
            ));
            let scheduler = WorkScheduler::spawn(Arc::clone(&controller));
            Self {
                clock,
                controller,
                scheduler,
                counter: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn tally(&self) -> impl FnOnce() + Send + 'static {
            let counter = Arc::clone(&self.counter);
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn ran(&self) -> usize {
            self.counter.load(Ordering::Relaxed)
        }

        fn enter_transition(&self) {
            for _ in 0..30 {
                self.clock.advance(16.0);
                self.controller.end_frame();
            }
            for _ in 0..5 {
                self.controller.record_shader();
            }
            self.clock.advance(30.0);
            self.controller.end_frame();
            assert!(self.controller.in_transition());
        }
    }

    #[test]
    fn idle_work_runs_inline_up_to_the_budget() {
        let rig = Rig::new();
        // Idle budget is 16 work items per frame.
        for _ in 0..16 {
            assert!(rig.scheduler.schedule(WorkPriority::Normal, rig.tally()));
        }
        assert!(!rig.scheduler.schedule(WorkPriority::Normal, rig.tally()));
        assert_eq!(rig.ran(), 16);
        assert_eq!(rig.scheduler.pending_len(), 1);
        rig.scheduler.shutdown();
    }

    #[test]
    fn critical_work_always_runs() {
        let rig = Rig::new();
        rig.enter_transition();
        assert!(rig.scheduler.schedule(WorkPriority::Critical, rig.tally()));
        assert_eq!(rig.ran(), 1);
        rig.scheduler.shutdown();
    }

    #[test]
    fn grace_defers_everything_sub_critical() {
        let rig = Rig::new();
        rig.enter_transition();
        assert_eq!(rig.controller.state(), TransitionState::Grace);

        assert!(!rig.scheduler.schedule(WorkPriority::Normal, rig.tally()));
        assert!(!rig.scheduler.schedule(WorkPriority::Low, rig.tally()));
        assert_eq!(rig.ran(), 0);
        assert_eq!(rig.scheduler.pending_len(), 2);
        rig.scheduler.shutdown();
    }

    #[test]
    fn external_pressure_defers_like_a_transition() {
        let rig = Rig::new();
        rig.scheduler.set_external_pressure(true);
        assert!(!rig.scheduler.schedule(WorkPriority::Normal, rig.tally()));
        rig.scheduler.set_external_pressure(false);
        assert!(rig.scheduler.schedule(WorkPriority::Normal, rig.tally()));
        assert_eq!(rig.ran(), 1);
        rig.scheduler.shutdown();
    }

    #[test]
    fn frame_boundary_drain_respects_the_budget() {
        let rig = Rig::new();
        rig.enter_transition();
        for _ in 0..10 {
            rig.scheduler.schedule(WorkPriority::Normal, rig.tally());
        }
        assert_eq!(rig.ran(), 0);

        // Still in Grace: the per-frame budget is 2.
        assert_eq!(rig.scheduler.process_deferred(), 2);
        assert_eq!(rig.ran(), 2);
        assert_eq!(rig.scheduler.pending_len(), 8);
        rig.scheduler.shutdown();
    }

    #[test]
    fn drain_takes_critical_before_normal_before_low() {
        let rig = Rig::new();
        rig.enter_transition();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [
            (WorkPriority::Low, "low"),
            (WorkPriority::Normal, "normal"),
        ] {
            let order = Arc::clone(&order);
            rig.scheduler.schedule(priority, move || order.lock().push(tag));
        }

        assert_eq!(rig.scheduler.process_deferred(), 2);
        assert_eq!(*order.lock(), vec!["normal", "low"]);
        rig.scheduler.shutdown();
    }

    #[test]
    fn background_thread_drains_low_band_when_calm() {
        let rig = Rig::new();
        rig.enter_transition();
        rig.scheduler.schedule(WorkPriority::Low, rig.tally());
        assert_eq!(rig.ran(), 0);

        // Calm the controller down; the background thread picks it up.
        for _ in 0..20 {
            rig.clock.advance(14.0);
            rig.controller.end_frame();
        }
        while rig.controller.state() != TransitionState::Idle {
            rig.clock.advance(14.0);
            rig.controller.end_frame();
        }
        let deadline = Instant::now() + Duration::from_millis(2000);
        while rig.ran() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rig.ran(), 1);
        assert_eq!(rig.scheduler.stats().drained_background, 1);
        rig.scheduler.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_work_and_counts_it() {
        let rig = Rig::new();
        rig.enter_transition();
        for _ in 0..5 {
            rig.scheduler.schedule(WorkPriority::Normal, rig.tally());
        }
        rig.scheduler.shutdown();
        assert_eq!(rig.scheduler.stats().dropped_on_shutdown, 5);
        assert_eq!(rig.scheduler.pending_len(), 0);
        // Post-shutdown scheduling is refused.
        assert!(!rig.scheduler.schedule(WorkPriority::Critical, rig.tally()));
        assert_eq!(rig.ran(), 0);
    }
}
