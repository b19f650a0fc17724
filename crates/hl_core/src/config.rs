/// Every knob the fabric recognizes.
///
/// A plain options record: construct one, tweak fields, hand it to the
/// fabric at startup. All durations are milliseconds on a 64-bit monotonic
/// tick.
#[derive(Clone, Debug, PartialEq)]
pub struct FabricConfig {
    /// Max entries in the exact-address hot cache.
    pub hot_cache_cap: usize,

    /// Soft cap on the speculative queue.
    pub queue_max_size: usize,

    /// Execution count at which a function arms speculation of its successors.
    pub spec_threshold: u32,

    /// How many speculative hops to follow from an armed function.
    pub max_spec_depth: u8,

    /// Strict post-transition throttle window.
    pub grace_ms: u64,

    /// Relaxed throttle window entered when grace ends.
    pub extended_grace_ms: u64,

    /// Minimum gap between two scene transitions.
    pub transition_cooldown_ms: u64,

    /// A frame slower than this counts as a spike.
    pub spike_frame_ms: f64,

    /// Initial adaptive threshold for shader-build spikes.
    pub shader_spike_base: u32,

    /// Initial adaptive threshold for texture-load spikes.
    pub texture_spike_base: u32,

    /// Size of the translation worker pool. `None` derives it from the
    /// available cores.
    pub worker_count: Option<usize>,

    /// Aging quantum of the request queue: a band-`p` request older than
    /// `age_unit_ms * (p + 1)` is promoted one band.
    pub age_unit_ms: u64,
}

impl Default for FabricConfig {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FabricConfig {
    pub const DEFAULT: Self = Self {
        hot_cache_cap: 4096,
        queue_max_size: 256,
        spec_threshold: 3,
        max_spec_depth: 4,
        grace_ms: 300,
        extended_grace_ms: 150,
        transition_cooldown_ms: 1000,
        spike_frame_ms: 25.0,
        shader_spike_base: 3,
        texture_spike_base: 5,
        worker_count: None,
        age_unit_ms: 500,
    };

    /// The worker-pool size actually used: the configured count, or
    /// `clamp(ceil((cores - 2) / 2 * 1.5), 2, max(8, cores - 2))`.
    pub fn effective_worker_count(&self) -> usize {
        if let Some(count) = self.worker_count {
            return count.max(1);
        }
        let cores = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self::derived_worker_count(cores)
    }

    pub(crate) fn derived_worker_count(cores: usize) -> usize {
        let spare = cores.saturating_sub(2);
        // ceil(spare / 2 * 1.5) == ceil(3 * spare / 4)
        let derived = (spare * 3).div_ceil(4);
        derived.clamp(2, 8.max(spare))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_worker_count_clamps() {
        // Small machines always get at least two workers.
        assert_eq!(FabricConfig::derived_worker_count(1), 2);
        assert_eq!(FabricConfig::derived_worker_count(4), 2);
        // 8 cores: ceil(6 * 3 / 4) = 5.
        assert_eq!(FabricConfig::derived_worker_count(8), 5);
        // 16 cores: ceil(14 * 3 / 4) = 11, upper clamp max(8, 14) = 14.
        assert_eq!(FabricConfig::derived_worker_count(16), 11);
        // 64 cores: ceil(62 * 3 / 4) = 47, still under the cores - 2 cap.
        assert_eq!(FabricConfig::derived_worker_count(64), 47);
    }

    #[test]
    fn explicit_worker_count_wins() {
        let config = FabricConfig {
            worker_count: Some(3),
            ..Default::default()
        };
        assert_eq!(config.effective_worker_count(), 3);
    }
}
