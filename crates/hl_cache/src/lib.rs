//! The translation cache: guest address → translated artifact.
//!
//! Two layers, by design:
//!
//! * [`HotCache`]: a bounded, sharded exact-address map. Probabilistic: an
//!   address missing here may still be cached. Reads never touch the big
//!   reader/writer lock.
//! * the authoritative [`hl_interval_map::IntervalMap`] behind a
//!   writer-preferring `RwLock`, queried on hot misses and for every range
//!   operation (overlap scans, invalidation).
//!
//! [`TranslationCache`] composes the two and is the only surface the
//! executor sees.

mod hot;
mod translation;

pub use hot::{HotCache, HotCacheStats};
pub use translation::{CacheStats, TranslationCache};
