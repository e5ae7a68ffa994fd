//! Diagnostics for the runner binaries.
//!
//! Tracing goes to stderr only. Product artifacts (prompts, replies, node
//! folders, `token_usage.json`) are written by the artifact store and never
//! depend on `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `info`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=mlrunner=debug mlrunner run data/ out/ config.toml 10
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second call (tests, embedding binaries) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
