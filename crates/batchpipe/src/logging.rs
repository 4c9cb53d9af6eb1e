//! Process-wide log setup.
//!
//! Library code logs through both the `log` facade and `tracing`; records
//! from `log` are bridged into the tracing subscriber installed here.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::LoggingError;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails if a subscriber or
/// `log` logger is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        )
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
    };
    installed?;

    tracing_log::LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init()?;
    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            EnvFilter::try_new(&config.level).map_err(|source| LoggingError::InvalidFilter {
                level: config.level.clone(),
                source,
            })
        }
    }
}
