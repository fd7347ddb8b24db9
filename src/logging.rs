//! Tracing subscriber setup for the server binary and tests.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber once; later calls are no-ops.
///
/// `default_level` applies when `RUST_LOG` is unset.
pub fn init_logging(default_level: &str) {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    let level = default_level.to_string();
    INSTALLED.get_or_init(move || {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let _ = fmt().with_env_filter(filter).with_target(true).try_init();
    });
}
