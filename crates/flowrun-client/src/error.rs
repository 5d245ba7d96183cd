//! Error types for the clients.

use thiserror::Error;

/// Errors that can occur when talking to external services.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure: connection refused, timeout, reset.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Client construction failed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}
