//! Capability contracts and configuration shared by all hotlane crates.
//!
//! The fabric is workload-agnostic: it never looks inside a translated
//! artifact or a GPU program. Everything it needs from the host process is
//! expressed as one of the capability traits in this crate, and everything
//! the host can tune is a field on [`FabricConfig`].

mod config;
mod traits;

pub use config::FabricConfig;
pub use traits::{
    Compiler, GuestMemory, ProgramInfo, RenderBackend, ShaderSource, ShaderStage, Translated,
};

// ---

/// Execution mode a guest function should be translated for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecMode {
    /// Fast single-pass translation, used on the demand path.
    #[default]
    Baseline,

    /// Optimizing re-translation of a function that proved hot.
    Optimized,
}

/// Why an external producer failed to deliver an artifact.
///
/// Producer failures on opportunistic paths are counted and dropped; only the
/// demand path surfaces them to the caller.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    #[error("guest address {0:#x} is not mapped")]
    Unmapped(u64),

    #[error("translation failed at {addr:#x}: {reason}")]
    Failed { addr: u64, reason: String },

    #[error("producer is shutting down")]
    Shutdown,
}

/// Priority of a queued request, band 0 being the most urgent.
///
/// The numeric value doubles as the band index in the request queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub const NUM_BANDS: usize = 5;

    #[inline]
    pub fn band(self) -> usize {
        self as usize
    }

    pub fn from_band(band: usize) -> Option<Self> {
        match band {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            4 => Some(Self::Background),
            _ => None,
        }
    }

    /// The next band up, or `None` if already critical.
    #[inline]
    pub fn promoted(self) -> Option<Self> {
        Self::from_band(self.band().wrapping_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bands_round_trip() {
        for band in 0..Priority::NUM_BANDS {
            assert_eq!(Priority::from_band(band).unwrap().band(), band);
        }
        assert_eq!(Priority::from_band(5), None);
        assert_eq!(Priority::Critical.promoted(), None);
        assert_eq!(Priority::Background.promoted(), Some(Priority::Low));
    }
}
