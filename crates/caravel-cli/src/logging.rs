//! Logging setup.
//!
//! `--log-level` controls the verbosity of the command trace, not of
//! error reporting. `RUST_LOG` takes precedence when set, matching the
//! tracing ecosystem's conventions.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber from a CLI level name.
pub(crate) fn init(level: &str) {
    let directive = match level {
        "critical" => "error",
        "warning" => "warn",
        other => other,
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
