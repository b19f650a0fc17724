//! Text logging for the hotlane crates.
//!
//! * `trace`: spammy things (per-request queue traffic)
//! * `debug`: things that might be useful when debugging
//! * `info`: things we want to show to users (startup, shutdown)
//! * `warn`: problems we recover from (dropped work, failed compiles)
//! * `error`: problems that lead to loss of functionality

pub use log::{debug, error, info, trace, warn};

pub use log::{Level, LevelFilter};

/// Directs [`log`] calls to stderr, filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn setup_logging() {
    fn setup() {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());

        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&filter);
        builder.try_init().ok();

        if filter.contains("trace") {
            log::set_max_level(log::LevelFilter::Trace);
        } else if filter.contains("debug") {
            log::set_max_level(log::LevelFilter::Debug);
        }
    }

    use std::sync::Once;
    static START: Once = Once::new();
    START.call_once(setup);
}
