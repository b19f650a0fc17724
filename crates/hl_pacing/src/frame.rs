//! The scene-transition state machine.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hl_core::FabricConfig;

use crate::{FrameClock, MonotonicClock};

/// Frames of history the spike detector looks at.
const HISTORY: usize = 60;

/// A transition ends early after this many consecutive light frames.
const LIGHT_FRAMES_TO_SETTLE: u32 = 20;

/// Spike-frame count in the history window that qualifies as sustained
/// heavy load.
const HEAVY_PATTERN_FRAMES: usize = 3;

/// Approach rate of the adaptive spike thresholds.
const ADAPT_RATE: f64 = 0.01;

// ---

/// Where the frame pipeline currently stands. Exactly one state is active;
/// transitions happen only inside [`FrameController::end_frame`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TransitionState {
    /// Steady state: background work runs freely.
    #[default]
    Idle = 0,

    /// A load spike is in progress (scene change, shader storm). Background
    /// work is throttled.
    Transition = 1,

    /// Strict cooldown right after a spike was detected; almost everything
    /// defers.
    Grace = 2,

    /// Relaxed tail of the cooldown.
    ExtendedGrace = 3,
}

impl TransitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Transition,
            2 => Self::Grace,
            3 => Self::ExtendedGrace,
            _ => Self::Idle,
        }
    }

    /// Per-state budgets: (max shaders, max textures, max work items,
    /// sync-timeout scale, recommended frame skip).
    fn budgets(self) -> (u32, u32, u32, f32, u32) {
        match self {
            Self::Idle => (4, 8, 16, 1.0, 0),
            Self::Transition => (2, 3, 4, 0.3, 1),
            Self::Grace => (1, 2, 2, 0.05, 1),
            Self::ExtendedGrace => (2, 4, 8, 0.1, 0),
        }
    }
}

#[derive(Clone, Copy, Default)]
struct FrameSample {
    frame_time_ms: f64,
    shaders: u32,
    textures: u32,
}

struct Inner {
    history: [FrameSample; HISTORY],
    history_len: usize,
    history_next: usize,

    last_frame_at: f64,
    transition_active: bool,
    transition_started_at: f64,
    frames_in_transition: u32,
    consecutive_light: u32,
    consecutive_heavy: u32,
    grace_until: f64,
    ext_grace_until: f64,
    last_transition_ended_at: f64,

    adaptive_shader_threshold: f64,
    adaptive_texture_threshold: f64,

    state: TransitionState,
}

/// Aggregate view of the controller, for telemetry and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameControllerMetrics {
    pub state: TransitionState,
    pub avg_frame_time_ms: f64,
    pub spike_frames_in_window: usize,
    pub total_frames: u64,
    pub total_shaders: u64,
    pub total_textures: u64,
    pub total_buffer_uploads: u64,
    pub total_transitions: u64,
}

/// The frame-pacing feedback loop.
///
/// Single-writer: the render thread calls the `record_*` signals and
/// [`Self::end_frame`] (the only state-transition point). Any thread may
/// call the query methods; they read atomics that `end_frame` publishes
/// last, so readers always see a consistent (state, budgets) snapshot.
pub struct FrameController {
    clock: Arc<dyn FrameClock>,

    grace_ms: f64,
    extended_grace_ms: f64,
    cooldown_ms: f64,
    spike_frame_ms: f64,
    shader_spike_base: f64,
    texture_spike_base: f64,

    // Per-frame counters, reset by `end_frame`.
    shaders_this_frame: AtomicU32,
    textures_this_frame: AtomicU32,
    buffers_this_frame: AtomicU32,

    // Lifetime totals.
    total_frames: AtomicU64,
    total_shaders: AtomicU64,
    total_textures: AtomicU64,
    total_buffer_uploads: AtomicU64,
    total_transitions: AtomicU64,

    inner: Mutex<Inner>,

    // Published snapshot, written last in `end_frame`.
    published_state: AtomicU32,
    published_transitioning: AtomicBool,
    published_heavy: AtomicBool,
    published_max_shaders: AtomicU32,
    published_max_textures: AtomicU32,
    published_max_work_items: AtomicU32,
    published_timeout_scale: AtomicU32,
    published_frame_skip: AtomicU32,
}

impl FrameController {
    pub fn new(config: &FabricConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: &FabricConfig, clock: Arc<dyn FrameClock>) -> Self {
        let now = clock.now_ms();
        let cooldown_ms = config.transition_cooldown_ms as f64;
        let controller = Self {
            clock,
            grace_ms: config.grace_ms as f64,
            extended_grace_ms: config.extended_grace_ms as f64,
            cooldown_ms,
            spike_frame_ms: config.spike_frame_ms,
            shader_spike_base: f64::from(config.shader_spike_base),
            texture_spike_base: f64::from(config.texture_spike_base),
            shaders_this_frame: AtomicU32::new(0),
            textures_this_frame: AtomicU32::new(0),
            buffers_this_frame: AtomicU32::new(0),
            total_frames: AtomicU64::new(0),
            total_shaders: AtomicU64::new(0),
            total_textures: AtomicU64::new(0),
            total_buffer_uploads: AtomicU64::new(0),
            total_transitions: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                history: [FrameSample::default(); HISTORY],
                history_len: 0,
                history_next: 0,
                last_frame_at: now,
                transition_active: false,
                transition_started_at: now,
                frames_in_transition: 0,
                consecutive_light: 0,
                consecutive_heavy: 0,
                grace_until: now,
                ext_grace_until: now,
                // The cooldown gates the gap *between* transitions; it must
                // not suppress the first one.
                last_transition_ended_at: now - cooldown_ms,
                adaptive_shader_threshold: f64::from(config.shader_spike_base),
                adaptive_texture_threshold: f64::from(config.texture_spike_base),
                state: TransitionState::Idle,
            }),
            published_state: AtomicU32::new(TransitionState::Idle as u32),
            published_transitioning: AtomicBool::new(false),
            published_heavy: AtomicBool::new(false),
            published_max_shaders: AtomicU32::new(0),
            published_max_textures: AtomicU32::new(0),
            published_max_work_items: AtomicU32::new(0),
            published_timeout_scale: AtomicU32::new(0),
            published_frame_skip: AtomicU32::new(0),
        };
        controller.publish(TransitionState::Idle, false, false);
        controller
    }

    // --- Render-thread inputs ---

    pub fn record_shader(&self) {
        self.shaders_this_frame.fetch_add(1, Ordering::Relaxed);
        self.total_shaders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_texture(&self) {
        self.textures_this_frame.fetch_add(1, Ordering::Relaxed);
        self.total_textures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_upload(&self) {
        self.buffers_this_frame.fetch_add(1, Ordering::Relaxed);
        self.total_buffer_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes out the frame: pushes history, advances the state machine,
    /// re-publishes budgets, resets the per-frame counters.
    pub fn end_frame(&self) {
        let now = self.clock.now_ms();
        let shaders = self.shaders_this_frame.swap(0, Ordering::Relaxed);
        let textures = self.textures_this_frame.swap(0, Ordering::Relaxed);
        self.buffers_this_frame.store(0, Ordering::Relaxed);
        self.total_frames.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        let frame_time = (now - inner.last_frame_at).max(0.0);
        inner.last_frame_at = now;
        Self::push_history(
            &mut inner,
            FrameSample {
                frame_time_ms: frame_time,
                shaders,
                textures,
            },
        );

        // Grace windows expire strictly at frame boundaries.
        if inner.state == TransitionState::ExtendedGrace && now >= inner.ext_grace_until {
            inner.state = if inner.transition_active {
                TransitionState::Transition
            } else {
                TransitionState::Idle
            };
        }
        if inner.state == TransitionState::Grace && now >= inner.grace_until {
            inner.state = TransitionState::ExtendedGrace;
            inner.ext_grace_until = now + self.extended_grace_ms;
        }

        if inner.transition_active {
            inner.frames_in_transition += 1;
            let light = shaders < 2 && textures < 3 && frame_time < self.spike_frame_ms;
            if light {
                inner.consecutive_light += 1;
                inner.consecutive_heavy = 0;
            } else {
                inner.consecutive_heavy += 1;
                inner.consecutive_light = 0;
            }

            let elapsed = now - inner.transition_started_at;
            if elapsed >= self.cooldown_ms || inner.consecutive_light >= LIGHT_FRAMES_TO_SETTLE {
                inner.transition_active = false;
                inner.state = TransitionState::ExtendedGrace;
                inner.ext_grace_until = now + self.extended_grace_ms;
                inner.last_transition_ended_at = now;
                self.total_transitions.fetch_add(1, Ordering::Relaxed);
                hl_log::debug!(
                    "transition ended after {:.0} ms / {} frames ({} consecutive heavy at exit)",
                    elapsed,
                    inner.frames_in_transition,
                    inner.consecutive_heavy
                );
            }
        } else if inner.state == TransitionState::Idle
            && now - inner.last_transition_ended_at > self.cooldown_ms
            && self.detect_spike(&inner, shaders, textures, frame_time)
        {
            inner.transition_active = true;
            inner.transition_started_at = now;
            inner.frames_in_transition = 0;
            inner.consecutive_light = 0;
            inner.consecutive_heavy = 0;
            inner.state = TransitionState::Grace;
            inner.grace_until = now + self.grace_ms;
            hl_log::debug!(
                "transition: {shaders} shaders, {textures} textures, {frame_time:.1} ms frame"
            );
        }

        // Nudge the adaptive thresholds toward this frame's load.
        let shader_target = self.shader_spike_base.max(0.8 * f64::from(shaders));
        let texture_target = self.texture_spike_base.max(0.8 * f64::from(textures));
        inner.adaptive_shader_threshold +=
            ADAPT_RATE * (shader_target - inner.adaptive_shader_threshold);
        inner.adaptive_texture_threshold +=
            ADAPT_RATE * (texture_target - inner.adaptive_texture_threshold);

        let state = inner.state;
        let transitioning = inner.transition_active;
        let heavy = self.spike_frames(&inner) >= HEAVY_PATTERN_FRAMES;
        drop(inner);

        // Atomics go last: concurrent readers either see the previous
        // frame's consistent snapshot or this one, never a half-update.
        self.publish(state, transitioning, heavy);
    }

    /// Drops all history and counters; the next frame starts from Idle
    /// (ROM switch).
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        *inner = Inner {
            history: [FrameSample::default(); HISTORY],
            history_len: 0,
            history_next: 0,
            last_frame_at: now,
            transition_active: false,
            transition_started_at: now,
            frames_in_transition: 0,
            consecutive_light: 0,
            consecutive_heavy: 0,
            grace_until: now,
            ext_grace_until: now,
            last_transition_ended_at: now - self.cooldown_ms,
            adaptive_shader_threshold: self.shader_spike_base,
            adaptive_texture_threshold: self.texture_spike_base,
            state: TransitionState::Idle,
        };
        drop(inner);
        self.shaders_this_frame.store(0, Ordering::Relaxed);
        self.textures_this_frame.store(0, Ordering::Relaxed);
        self.buffers_this_frame.store(0, Ordering::Relaxed);
        self.publish(TransitionState::Idle, false, false);
    }

    // --- Queries (any thread) ---

    pub fn state(&self) -> TransitionState {
        TransitionState::from_u8(self.published_state.load(Ordering::Acquire) as u8)
    }

    /// Is a transition in progress (including its grace windows)?
    pub fn in_transition(&self) -> bool {
        self.published_transitioning.load(Ordering::Acquire)
    }

    /// Did several recent frames blow the frame-time budget?
    pub fn heavy_load(&self) -> bool {
        self.published_heavy.load(Ordering::Acquire)
    }

    /// Should a shader build be pushed off the render thread right now?
    pub fn should_defer_shader_build(&self) -> bool {
        self.state() != TransitionState::Idle
            || self.shaders_this_frame.load(Ordering::Relaxed) >= self.max_shaders_this_frame()
    }

    pub fn max_shaders_this_frame(&self) -> u32 {
        self.published_max_shaders.load(Ordering::Acquire)
    }

    pub fn max_textures_this_frame(&self) -> u32 {
        self.published_max_textures.load(Ordering::Acquire)
    }

    pub fn max_work_items_this_frame(&self) -> u32 {
        self.published_max_work_items.load(Ordering::Acquire)
    }

    /// Scale factor for synchronous waits (fence timeouts and the like):
    /// deep throttle states shrink how long the render thread may block.
    pub fn sync_timeout_scale(&self) -> f32 {
        f32::from_bits(self.published_timeout_scale.load(Ordering::Acquire))
    }

    pub fn recommended_frame_skip(&self) -> u32 {
        self.published_frame_skip.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> FrameControllerMetrics {
        let inner = self.inner.lock();
        let avg = if inner.history_len == 0 {
            0.0
        } else {
            inner.history[..inner.history_len]
                .iter()
                .map(|s| s.frame_time_ms)
                .sum::<f64>()
                / inner.history_len as f64
        };
        FrameControllerMetrics {
            state: inner.state,
            avg_frame_time_ms: avg,
            spike_frames_in_window: self.spike_frames(&inner),
            total_frames: self.total_frames.load(Ordering::Relaxed),
            total_shaders: self.total_shaders.load(Ordering::Relaxed),
            total_textures: self.total_textures.load(Ordering::Relaxed),
            total_buffer_uploads: self.total_buffer_uploads.load(Ordering::Relaxed),
            total_transitions: self.total_transitions.load(Ordering::Relaxed),
        }
    }

    // --- Internals ---

    fn push_history(inner: &mut Inner, sample: FrameSample) {
        let next = inner.history_next;
        inner.history[next] = sample;
        inner.history_next = (next + 1) % HISTORY;
        inner.history_len = (inner.history_len + 1).min(HISTORY);
    }

    fn spike_frames(&self, inner: &Inner) -> usize {
        inner.history[..inner.history_len]
            .iter()
            .filter(|s| s.frame_time_ms > self.spike_frame_ms)
            .count()
    }

    fn detect_spike(&self, inner: &Inner, shaders: u32, textures: u32, frame_time: f64) -> bool {
        let shaders_f = f64::from(shaders);
        let textures_f = f64::from(textures);

        let shader_spike = shaders_f >= inner.adaptive_shader_threshold;
        let texture_spike = textures_f >= inner.adaptive_texture_threshold;
        let combined = shaders >= 2 && textures >= 3;
        let frame_time_spike = frame_time > self.spike_frame_ms && (shaders > 0 || textures > 2);
        let heavy_pattern = self.spike_frames(inner) >= HEAVY_PATTERN_FRAMES;

        shader_spike || texture_spike || combined || frame_time_spike || heavy_pattern
    }

    fn publish(&self, state: TransitionState, transitioning: bool, heavy: bool) {
        let (max_shaders, max_textures, max_work, scale, skip) = state.budgets();
        self.published_max_shaders.store(max_shaders, Ordering::Release);
        self.published_max_textures.store(max_textures, Ordering::Release);
        self.published_max_work_items.store(max_work, Ordering::Release);
        self.published_timeout_scale.store(scale.to_bits(), Ordering::Release);
        self.published_frame_skip.store(skip, Ordering::Release);
        self.published_transitioning.store(transitioning, Ordering::Release);
        self.published_heavy.store(heavy, Ordering::Release);
        // State last: it is the flag readers key off.
        self.published_state.store(state as u32, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
