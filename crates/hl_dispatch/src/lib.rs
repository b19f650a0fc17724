//! Priority work dispatch: the aged multi-band request queue and the worker
//! pool draining it.
//!
//! Demand traffic (the executor is *waiting* for this address) goes in at
//! [`hl_core::Priority::Critical`]; everything opportunistic enters lower
//! bands and ages its way up; a request can starve for at most a few
//! seconds before it reaches the critical band thanks to the aging cascade
//! in [`RejitQueue`].

mod pool;
mod queue;

pub use pool::{PoolStats, TranslatedHook, WorkerPool};
pub use queue::{QueueDepths, RejitQueue, RejitRequest};
