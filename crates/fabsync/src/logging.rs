//! Tracing subscriber setup.
//!
//! `log` macros are bridged into tracing so both end up in the same output.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::FabsyncError;

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "FABSYNC_LOG";

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<(), FabsyncError> {
    let filter = build_filter(config)?;

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json().with_current_span(true)))
        .with((!config.json).then(|| fmt::layer().with_target(false)));

    tracing_log::LogTracer::init().map_err(|e| FabsyncError::Logging(e.to_string()))?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| FabsyncError::Logging(e.to_string()))
}

/// `FABSYNC_LOG`, then `RUST_LOG`, then the configured level.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, FabsyncError> {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| config.level.clone());
    EnvFilter::try_new(&directives)
        .map_err(|e| FabsyncError::Logging(format!("invalid log filter '{}': {}", directives, e)))
}
