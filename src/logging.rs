//! Process-wide tracing setup for the CLI.
//!
//! Events go to stderr so stdout stays free for command output. The filter
//! comes from `UPKEEP_LOG`, then `RUST_LOG`, then defaults to `info`.

use std::io;

use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "UPKEEP_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid {LOG_ENV} directive {directive:?}: {message}")]
    InvalidDirective {
        /// Rejected directive.
        directive: String,
        /// Parser error message.
        message: String,
    },
    /// A global subscriber was already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the filter from `UPKEEP_LOG`, falling back to `RUST_LOG` and then
/// `info`.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidDirective`] when `UPKEEP_LOG` is set but
/// cannot be parsed. An invalid `RUST_LOG` falls back to the default.
pub fn env_filter(directive: Option<&str>) -> Result<EnvFilter, LoggingError> {
    match directive {
        Some(raw) => EnvFilter::try_new(raw).map_err(|err| LoggingError::InvalidDirective {
            directive: raw.to_owned(),
            message: err.to_string(),
        }),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))),
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] when the directive is invalid or a subscriber is
/// already installed.
pub fn init_logging() -> Result<(), LoggingError> {
    let directive = std::env::var(LOG_ENV).ok();
    let filter = env_filter(directive.as_deref())?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}
