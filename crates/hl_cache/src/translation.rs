//! The public surface of the address → artifact store.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use hl_interval_map::IntervalMap;
use hl_util::ScratchBuf;

use crate::HotCache;

// ---

/// Composes the hot cache and the interval map.
///
/// Lock discipline: the interval map sits behind a writer-preferring
/// `RwLock` (readers cannot starve writers). The hot cache is consulted
/// *before* the lock on every read, and read-side promotion goes through the
/// hot cache's own sharding, never by upgrading the read lock.
///
/// A successful insert happens-before any later `try_get` returning that
/// artifact: the insert publishes under the write lock, the reader observes
/// under the read lock (or through the hot entry written before the write
/// lock was released).
pub struct TranslationCache<V> {
    map: RwLock<IntervalMap<V>>,
    hot: HotCache<V>,

    lookups: AtomicU64,
    hot_hits: AtomicU64,
    map_hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    invalidations: AtomicU64,
}

/// Lifetime counters of a [`TranslationCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub lookups: u64,
    pub hot_hits: u64,
    pub map_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Hits through either layer.
    #[inline]
    pub fn hits(&self) -> u64 {
        self.hot_hits + self.map_hits
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits() as f64 / self.lookups as f64
        }
    }
}

impl<V: Clone> TranslationCache<V> {
    pub fn new(hot_cache_cap: usize) -> Self {
        Self {
            map: RwLock::new(IntervalMap::new()),
            hot: HotCache::new(hot_cache_cap),
            lookups: AtomicU64::new(0),
            hot_hits: AtomicU64::new(0),
            map_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// The hot-path lookup. Lock-free when the address is hot; otherwise a
    /// read-locked stabbing query, promoting the hit into the hot cache.
    pub fn try_get(&self, addr: u64) -> Option<V> {
        self.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.hot.try_get(addr) {
            self.hot_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let map = self.map.read();
        if let Some(value) = map.try_get(addr) {
            let value = value.clone();
            self.map_hits.fetch_add(1, Ordering::Relaxed);
            // Promote while still holding the read side, so a concurrent
            // invalidation (which scrubs the hot cache under the write lock)
            // cannot interleave and leave a stale hot entry behind.
            self.hot.insert_if_absent(addr, value.clone());
            drop(map);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inserts `[addr, addr + size)` unless it would conflict with anything
    /// already cached. Returns whether the artifact was inserted.
    pub fn try_add(&self, addr: u64, size: u64, value: V) -> bool {
        if size == 0 {
            return false;
        }
        let mut map = self.map.write();

        let mut scratch = ScratchBuf::take();
        if map.overlaps_into(addr, addr + size, &mut scratch) > 0 {
            return false;
        }
        let inserted = map
            .add_or_update(addr, addr + size, value.clone(), None)
            .unwrap_or(false);
        if inserted {
            self.inserts.fetch_add(1, Ordering::Relaxed);
            // Under the write lock, like every hot-cache mutation on the
            // write path: keeps hot entries consistent with the map.
            self.hot.insert_if_absent(addr, value);
        }
        drop(map);
        inserted
    }

    /// Inserts `[addr, addr + size)`, resolving conflicts through
    /// `on_conflict` (invoked once per conflicting cached interval). The hot
    /// entry for `addr` is refreshed only if already present. Returns whether
    /// a new interval node was created.
    pub fn add_or_update(
        &self,
        addr: u64,
        size: u64,
        value: V,
        on_conflict: &mut dyn FnMut(u64, &V) -> V,
    ) -> bool {
        debug_assert!(size > 0, "empty range at {addr:#x}");
        if size == 0 {
            return false;
        }
        let mut map = self.map.write();
        let created = map
            .add_or_update(addr, addr + size, value.clone(), Some(on_conflict))
            .expect("resolver supplied, overlap cannot be refused");
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.hot.update_if_present(addr, value);
        drop(map);
        created
    }

    /// Returns the artifact already cached for exactly `[addr, addr + size)`,
    /// inserting `value` if there is none. The returned artifact is promoted
    /// into the hot cache.
    pub fn get_or_add(&self, addr: u64, size: u64, value: V) -> V {
        let mut map = self.map.write();
        let before = map.len();
        let value = map.get_or_add(addr, addr + size, value).clone();
        if map.len() > before {
            self.inserts.fetch_add(1, Ordering::Relaxed);
        }
        self.hot.insert_if_absent(addr, value.clone());
        drop(map);
        value
    }

    /// Drops every interval starting at exactly `addr`. Returns whether
    /// anything was removed.
    pub fn remove(&self, addr: u64) -> bool {
        let mut map = self.map.write();
        self.hot.remove(addr);
        let removed = map.remove_at(addr);
        drop(map);

        if removed > 0 {
            self.invalidations.fetch_add(u64::from(removed), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Invalidates every cached interval intersecting `[addr, addr + size)`
    /// (e.g. the guest unmapped or rewrote that memory). Returns how many
    /// intervals were dropped.
    pub fn remove_overlapping(&self, addr: u64, size: u64) -> u32 {
        if size == 0 {
            return 0;
        }
        let mut map = self.map.write();

        let mut starts = ScratchBuf::take();
        map.overlaps_into(addr, addr + size, &mut starts);
        let mut removed = 0;
        for &start in starts.iter() {
            self.hot.remove(start);
            removed += map.remove_at(start);
        }
        drop(map);

        if removed > 0 {
            hl_log::debug!(
                "invalidated {removed} translation(s) overlapping [{addr:#x}, {:#x})",
                addr + size
            );
            self.invalidations.fetch_add(u64::from(removed), Ordering::Relaxed);
        }
        removed
    }

    /// Is `addr` covered by any cached interval?
    pub fn contains_key(&self, addr: u64) -> bool {
        self.map.read().contains_point(addr)
    }

    /// Appends the starts of all cached intervals intersecting
    /// `[addr, addr + size)` to `out`; returns the count.
    pub fn get_overlaps(&self, addr: u64, size: u64, out: &mut Vec<u64>) -> usize {
        if size == 0 {
            return 0;
        }
        self.map.read().overlaps_into(addr, addr + size, out)
    }

    pub fn count(&self) -> usize {
        self.map.read().len()
    }

    /// All cached artifacts, in address order.
    pub fn as_list(&self) -> Vec<V> {
        self.map.read().values_list()
    }

    pub fn clear(&self) {
        let mut map = self.map.write();
        self.hot.clear();
        map.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hot_hits: self.hot_hits.load(Ordering::Relaxed),
            map_hits: self.map_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// The fast-path layer's own counters.
    pub fn hot_stats(&self) -> crate::HotCacheStats {
        self.hot.stats()
    }
}

// ----------------------------------------------------------------------------
