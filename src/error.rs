//! Error types for the live session crate.

use thiserror::Error;

/// Crate error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Establishing the persistent connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// An event was emitted while the socket was down.
    #[error("not connected")]
    NotConnected,

    /// The connection has been closed for good.
    #[error("connection closed")]
    Closed,

    /// A wire frame could not be encoded or decoded.
    #[error("invalid frame: {0}")]
    Frame(String),

    /// An inbound event carried arguments of the wrong shape.
    #[error("malformed `{event}` payload: {reason}")]
    MalformedPayload {
        /// Event name the payload arrived under.
        event: String,
        /// What was wrong with it.
        reason: String,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// Invalid URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub(crate) fn malformed(event: &str, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;
