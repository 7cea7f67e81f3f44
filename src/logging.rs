//! Installs the global `tracing` subscriber for the binary.
//!
//! The filter comes from `RUST_LOG` and falls back to `info`. Output is
//! human-readable text by default or one JSON object per event.

use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as layer_fmt};

const DEFAULT_DIRECTIVE: &str = "info";

/// Output encoding for log events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// Plain text, one line per event.
    #[default]
    Text,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(LoggingError::UnknownFormat(value.to_owned())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Errors raised while installing the subscriber.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LoggingError {
    /// Raised for a format name other than `text` or `json`.
    #[error("unknown log format `{0}`; expected `text` or `json`")]
    UnknownFormat(String),
    /// Raised when `RUST_LOG` holds an unparsable directive.
    #[error("invalid log filter `{0}`")]
    InvalidFilter(String),
    /// Raised when a global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the event filter from `directives`, or from `info` when empty.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidFilter`] when the directives do not parse.
pub fn filter(directives: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directive = directives
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_DIRECTIVE);
    EnvFilter::try_new(directive).map_err(|_| LoggingError::InvalidFilter(directive.to_owned()))
}

/// Installs the global subscriber, writing events to standard error.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init(format: LogFormat) -> Result<(), LoggingError> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = filter(directives.as_deref())?;
    match format {
        LogFormat::Text => {
            let layer = layer_fmt::layer().with_writer(io::stderr).with_target(false);
            install(tracing_subscriber::registry().with(env_filter).with(layer))
        }
        LogFormat::Json => {
            let layer = layer_fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(io::stderr);
            install(tracing_subscriber::registry().with(env_filter).with(layer))
        }
    }
}

fn install<S>(subscriber: S) -> Result<(), LoggingError>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}
