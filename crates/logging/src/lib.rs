//! Dmsg Logging
//!
//! Subscriber setup for binaries and tests embedding dmsg entities.
//! `RUST_LOG` overrides the default filter.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,dmsg=debug";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Panics if one is already set.
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Like [`init`], with `filter` as the fallback directive set.
pub fn init_with_filter(filter: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter(filter))
        .init();
}

/// Subscriber for tests: output goes through the test harness capture and
/// repeated calls are ignored.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(env_filter(DEFAULT_FILTER))
        .try_init();
}
