//! Diagnostics via `tracing`, written to stderr.
//!
//! `RUST_LOG` wins when set; otherwise the configured `log_level` applies.
//! Secrets (API token, encryption password) are never logged.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// ```bash
/// RUST_LOG=c14backup=debug c14backup backup
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests, repeated calls) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
