//! Small primitives consumed by the rest of the hotlane workspace.
//!
//! Nothing in here knows about translation, shaders or frames; these are the
//! plain building blocks: power-of-two alignment math, an adaptive spin-wait,
//! a bounded single-producer/single-consumer ring, and a thread-local-cached
//! pool of reusable scratch buffers.

mod align;
mod scratch;
mod spin;
mod spsc;

pub use align::{align_down, align_up, is_aligned};
pub use scratch::ScratchBuf;
pub use spin::AdaptiveSpin;
pub use spsc::{spsc_ring, RingConsumer, RingProducer};
