//! hotlane: an adaptive work-dispatch and caching fabric.
//!
//! Sits between a dynamic binary translator (or any bursty artifact
//! producer), a shader compiler, and a soft-realtime frame loop. Keeps the
//! frame pipeline responsive while absorbing background work:
//!
//! * [`TranslationCache`] answers "what runs at this address" with a
//!   lock-free hot path in front of an interval-indexed store.
//! * [`RejitQueue`] + [`WorkerPool`] produce artifacts in the background,
//!   with priority bands, aging, and per-address dedup.
//! * [`SpeculativeTracer`] learns the guest's branch/call graph and queues
//!   likely-next translations ahead of demand.
//! * [`FrameController`] + [`WorkScheduler`] watch per-frame load, detect
//!   scene transitions, and throttle all of the above while frames are
//!   struggling.
//!
//! [`Fabric`] wires the pieces together; the host supplies the actual code
//! generator (and optionally a GPU backend) through the capability traits
//! in [`hl_core`].

mod fabric;
mod shader;

pub use fabric::{Fabric, FabricStats};
pub use shader::ShaderCompiler;

pub use hl_cache::{CacheStats, HotCacheStats, TranslationCache};
pub use hl_core::{
    CompileError, Compiler, ExecMode, FabricConfig, GuestMemory, Priority, ProgramInfo,
    RenderBackend, ShaderSource, ShaderStage, Translated,
};
pub use hl_dispatch::{PoolStats, RejitQueue, RejitRequest, WorkerPool};
pub use hl_pacing::{
    FrameClock, FrameController, FrameControllerMetrics, ManualClock, MonotonicClock,
    SchedulerStats, TransitionState, WorkPriority, WorkScheduler,
};
pub use hl_speculate::{SpecStats, SpeculativeTracer};
