//! Frame pacing: watch what each frame cost, detect scene transitions, and
//! gate background work so it lands in frames that can afford it.
//!
//! The [`FrameController`] is the process-wide policy surface: the render
//! thread feeds it per-frame signals, everything else queries it. The
//! [`WorkScheduler`] wraps opportunistic producers and decides, per work
//! item, between running now, deferring to a frame-boundary drain, or
//! handing off to a background thread.

mod clock;
mod frame;
mod sched;

pub use clock::{FrameClock, ManualClock, MonotonicClock};
pub use frame::{FrameController, FrameControllerMetrics, TransitionState};
pub use sched::{SchedulerStats, WorkPriority, WorkScheduler};
