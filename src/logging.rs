//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging for the binary. `RUST_LOG` controls filtering
/// (default "info", e.g. `RUST_LOG=crawlspace=debug,reqwest=warn`).
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .init();
}
