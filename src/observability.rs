//! Tracing subscriber bootstrap for binaries and tests embedding the pool.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV_VAR: &str = "DEVICE_POOL_LOG";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LoggingError {
    /// Raised when the filter directive does not parse.
    #[error("invalid log filter '{directive}': {message}")]
    InvalidFilter {
        /// Directive that failed to parse.
        directive: String,
        /// Parser error text.
        message: String,
    },
    /// Raised when a global subscriber is already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Builds the filter from `DEVICE_POOL_LOG`, falling back to `default`.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidFilter`] when the chosen directive does
/// not parse.
pub fn env_filter(default: &str) -> Result<EnvFilter, LoggingError> {
    let directive = std::env::var(LOG_ENV_VAR)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_owned());
    EnvFilter::try_new(&directive).map_err(|err| LoggingError::InvalidFilter {
        directive,
        message: err.to_string(),
    })
}

/// Installs a global fmt subscriber writing to stderr.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init_tracing(default: &str) -> Result<(), LoggingError> {
    let filter = env_filter(default)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| LoggingError::AlreadyInstalled(err.to_string()))
}
