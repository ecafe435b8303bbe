//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single run can be
//! made more verbose without touching the configuration file.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Calling it again is a no-op.
pub fn init(config: &LoggingConfig) {
    let filter = env_filter(config);
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
