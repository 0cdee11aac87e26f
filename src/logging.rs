//! Logging setup, shared by every binary entry point.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Builds the `RUST_LOG` filter, defaulting to `info` and quieting a couple
/// of noisy crates the way the teacher's own filter layer does for its web
/// stack's dependencies.
pub fn build_loglevel_filter_layer() -> EnvFilter {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    EnvFilter::new(format!("{base},mio=warn,tokio_util=warn"))
}

/// Installs the global `tracing` subscriber. Call once at process start.
pub fn init_subscriber() {
    tracing_subscriber::registry()
        .with(build_loglevel_filter_layer())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
