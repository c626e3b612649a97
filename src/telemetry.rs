//! Tracing setup for embedders that do not install their own subscriber.

use tracing_subscriber::EnvFilter;

/// Initialize a global tracing subscriber.
///
/// `RUST_LOG` takes precedence; `default_level` is used when the variable
/// is absent or unparsable. Calling this twice is a no-op.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
