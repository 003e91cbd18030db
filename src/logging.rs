//! Subscriber setup for the command-line tool.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to binaries. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;
use crate::error::SummaryError;

/// Build the event filter for `config`, preferring `RUST_LOG` when set.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, SummaryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| SummaryError::Config(format!("invalid logging.level: {e}"))),
    }
}

/// Install the global subscriber. Logs go to stderr so that stdout carries
/// only command output.
pub fn init(config: &LoggingConfig) -> Result<(), SummaryError> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    result.map_err(|e| SummaryError::Config(format!("failed to install logger: {e}")))
}
