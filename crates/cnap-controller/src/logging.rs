//! Tracing subscriber setup for binaries.

use tracing_subscriber::EnvFilter;

/// Fallback log directive used when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "CNAP_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Build the filter: `RUST_LOG` if set, else `fallback`, else `info`.
/// Unparseable directives fall through to the next choice.
pub fn build_filter(rust_log: Option<&str>, fallback: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| fallback.and_then(|d| EnvFilter::try_new(d).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global fmt subscriber. Call once, from `main`.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let fallback = std::env::var(LOG_ENV).ok();
    let filter = build_filter(rust_log.as_deref(), fallback.as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
}
