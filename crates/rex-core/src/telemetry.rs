//! Tracing setup for binaries
//!
//! Library code only emits events; installing a subscriber is left to the
//! process entry point.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Same as [`init_tracing`] with JSON lines output
pub fn init_json_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
