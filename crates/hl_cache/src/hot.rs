//! The exact-address fast path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use nohash_hasher::IntMap;
use parking_lot::Mutex;

const NUM_SHARDS: usize = 64;

/// A bounded concurrent `u64 -> V` map used as a probabilistic filter in
/// front of the interval map.
///
/// Not authoritative: entries are dropped wholesale when the cache fills
/// up, and a miss here says nothing about the interval map. Eviction is
/// deliberately not LRU: when `len` reaches the cap, one thread (elected
/// by a CAS that pre-subtracts half the cap) throws out an arbitrary half.
/// Under heavy contention the cache may transiently shrink further than
/// that; it refills from interval-map hits within a few lookups.
pub struct HotCache<V> {
    shards: Vec<Mutex<IntMap<u64, V>>>,
    cap: usize,

    len: AtomicUsize,
    lookups: AtomicU64,
    hits: AtomicU64,
}

/// Counters snapshot, taken without any lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HotCacheStats {
    pub len: usize,
    pub cap: usize,
    pub lookups: u64,
    pub hits: u64,
}

impl HotCacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

impl<V: Clone> HotCache<V> {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(NUM_SHARDS);
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(IntMap::default())).collect(),
            cap,
            len: AtomicUsize::new(0),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, addr: u64) -> &Mutex<IntMap<u64, V>> {
        // Fibonacci scrambling: block starts are typically 4-byte aligned,
        // so the low bits alone would leave most shards idle.
        let index = (addr.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 58) as usize;
        &self.shards[index % NUM_SHARDS]
    }

    pub fn try_get(&self, addr: u64) -> Option<V> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let hit = self.shard(addr).lock().get(&addr).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Inserts unless the address is already present. Returns whether the
    /// entry was inserted.
    pub fn insert_if_absent(&self, addr: u64, value: V) -> bool {
        self.maybe_evict();
        let inserted = {
            let mut shard = self.shard(addr).lock();
            match shard.entry(addr) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(value);
                    true
                }
                std::collections::hash_map::Entry::Occupied(_) => false,
            }
        };
        if inserted {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Replaces the value only if the address is already cached.
    pub fn update_if_present(&self, addr: u64, value: V) -> bool {
        let mut shard = self.shard(addr).lock();
        if let Some(slot) = shard.get_mut(&addr) {
            *slot = value;
            true
        } else {
            false
        }
    }

    pub fn remove(&self, addr: u64) -> bool {
        let removed = self.shard(addr).lock().remove(&addr).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let drained = shard.len();
            shard.clear();
            // Saturating: a clear racing an eviction (which pre-subtracts
            // its quota) must not wrap the counter.
            let _ = self.len.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |len| {
                Some(len.saturating_sub(drained))
            });
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HotCacheStats {
        HotCacheStats {
            len: self.len(),
            cap: self.cap,
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// When full, elect a single evictor via CAS and drop half the entries.
    ///
    /// The CAS pre-subtracts `cap / 2` so concurrent inserters see a cache
    /// with room again immediately; the loser threads just proceed. The
    /// shortfall (if concurrent removals already shrank the shards) is
    /// credited back afterwards.
    fn maybe_evict(&self) {
        let target = self.cap / 2;
        loop {
            let len = self.len.load(Ordering::Relaxed);
            if len < self.cap {
                return;
            }
            if self
                .len
                .compare_exchange(len, len - target, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            hl_log::debug!("hot cache full ({len} entries), evicting {target}");
            let mut remaining = target;
            for shard in &self.shards {
                if remaining == 0 {
                    break;
                }
                let mut shard = shard.lock();
                // Arbitrary victims: whatever iteration order yields.
                let victims: Vec<u64> =
                    shard.keys().copied().take(remaining).collect();
                for addr in victims {
                    shard.remove(&addr);
                    remaining -= 1;
                }
            }
            if remaining > 0 {
                self.len.fetch_add(remaining, Ordering::Relaxed);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let cache = HotCache::new(128);
        assert!(cache.insert_if_absent(0x1000, "a"));
        assert!(!cache.insert_if_absent(0x1000, "b"));
        assert_eq!(cache.try_get(0x1000), Some("a"));
        assert_eq!(cache.try_get(0x2000), None);

        assert!(cache.update_if_present(0x1000, "c"));
        assert!(!cache.update_if_present(0x2000, "c"));
        assert_eq!(cache.try_get(0x1000), Some("c"));

        assert!(cache.remove(0x1000));
        assert!(!cache.remove(0x1000));
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.lookups, 3);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn eviction_halves_the_cache() {
        let cache = HotCache::new(128);
        for addr in 0..128u64 {
            cache.insert_if_absent(addr * 4, addr);
        }
        assert_eq!(cache.len(), 128);

        // The next insert elects an evictor and drops half.
        cache.insert_if_absent(0x9999, 0);
        assert!(cache.len() <= 128 / 2 + 1, "len = {}", cache.len());

        // Everything still resolves consistently: present or absent, never
        // a wrong value.
        for addr in 0..128u64 {
            if let Some(v) = cache.try_get(addr * 4) {
                assert_eq!(v, addr);
            }
        }
    }

    #[test]
    fn len_never_exceeds_cap_plus_half_under_contention() {
        use std::sync::Arc;

        let cache = Arc::new(HotCache::new(256));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..4096u64 {
                        cache.insert_if_absent(t * 1_000_000 + i, i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // Transient overshoot is bounded by half the cap.
        assert!(cache.len() <= 256 + 128, "len = {}", cache.len());
    }

    #[test]
    fn clear_resets_len() {
        let cache = HotCache::new(64);
        for addr in 0..50u64 {
            cache.insert_if_absent(addr, addr);
        }
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.try_get(7), None);
    }
}
