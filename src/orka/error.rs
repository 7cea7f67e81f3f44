//! Error types for the Orka VM API client.

use thiserror::Error;

use super::types::ApiResponse;

/// Message the service returns when no node has enough free CPU.
pub const INSUFFICIENT_CPU_MESSAGE: &str = "No available nodes with sufficient CPU.";

/// Errors raised by the Orka API client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrkaError {
    /// The cluster cannot currently fit the VM.
    #[error("No available nodes with sufficient CPU.")]
    InsufficientCapacity,
    /// The service reported one or more errors.
    #[error("{}", .messages.join("; "))]
    Api {
        /// Messages from the response error list.
        messages: Vec<String>,
    },
    /// The request could not be sent or the response not read.
    #[error("orka request {method} {url} failed: {message}")]
    Http {
        /// HTTP method of the failed request.
        method: String,
        /// Target URL.
        url: String,
        /// Transport error text.
        message: String,
    },
    /// The response body was not the expected JSON document.
    #[error("orka response from {url} could not be decoded (status {status}): {message}")]
    Decode {
        /// Target URL.
        url: String,
        /// HTTP status code of the response.
        status: u16,
        /// Decoder error text.
        message: String,
    },
    /// The deploy response did not include an address to dial.
    #[error("deploy response for {name} did not include an ip and ssh port")]
    MissingAddress {
        /// VM name.
        name: String,
    },
    /// The token check reported an unusable token.
    #[error("orka token is not valid (authenticated: {authenticated}, revoked: {revoked})")]
    InvalidToken {
        /// Whether the token authenticated.
        authenticated: bool,
        /// Whether the token has been revoked.
        revoked: bool,
    },
}

impl OrkaError {
    /// Returns `true` when the service reported capacity exhaustion.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity)
    }
}

/// Converts the error list of a response into an error, if any.
///
/// Capacity exhaustion takes precedence over other messages so callers can
/// retry on it.
pub(crate) fn check_errors(response: &ApiResponse) -> Result<(), OrkaError> {
    if response.errors.is_empty() {
        return Ok(());
    }
    if response
        .errors
        .iter()
        .any(|err| err.message == INSUFFICIENT_CPU_MESSAGE)
    {
        return Err(OrkaError::InsufficientCapacity);
    }
    Err(OrkaError::Api {
        messages: response
            .errors
            .iter()
            .map(|err| err.message.clone())
            .collect(),
    })
}
