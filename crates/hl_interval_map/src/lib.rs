//! An ordered map from half-open `[start, end)` address ranges to values.
//!
//! The backbone of the translation cache: translated functions cover address
//! ranges, and the executor asks "which artifact covers this address?"
//! ([`IntervalMap::try_get`], a stabbing query) or "which ranges intersect
//! this invalidated region?" ([`IntervalMap::overlaps_into`]).
//!
//! Implemented as an AVL tree ordered by `(start, end)` where every node
//! also stores the maximum `end` in its subtree, giving `O(log n + k)`
//! stabbing and overlap queries.
//!
//! The map itself is single-threaded; concurrent use is layered on top by
//! `hl_cache` behind a reader/writer lock.

mod tree;

pub use tree::{ConflictResolver, IntervalMap, Iter};

// ---

/// Why an insert was refused.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// `start == end` describes no addresses at all; storing it would only
    /// poison the no-overlap discipline of the callers.
    #[error("empty interval at {start:#x}")]
    EmptyInterval { start: u64 },

    /// The new range intersects existing ranges and no conflict resolver
    /// was supplied.
    #[error("interval [{start:#x}, {end:#x}) overlaps {count} existing interval(s)")]
    Overlap { start: u64, end: u64, count: usize },
}
