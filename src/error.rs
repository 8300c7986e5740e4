//! Error types for subreddit-dl
//!
//! One crate-wide [`Error`] enum covers every failure the pipeline can hit.
//! Which of them are recoverable is decided by [`crate::retry::classify`],
//! not by the variants themselves.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for subreddit-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for subreddit-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration property that caused the error (e.g., "/post_limit")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request could not be completed (connection, timeout, body decode, ...)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Server answered with an unsuccessful status code
    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// URL has no host, cannot be parsed, or points at an unsupported host
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why the URL was rejected
        reason: String,
    },

    /// Response content type has no known image file extension
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Watermark state file could not be loaded
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// A custom post filter failed while evaluating a post
    #[error("post filter {name} failed: {reason}")]
    Filter {
        /// Registered filter name
        name: String,
        /// Failure description
        reason: String,
    },

    /// OAuth token could not be obtained or was malformed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Watermark state file errors
#[derive(Debug, Error)]
pub enum StateError {
    /// File exists but is not valid JSON of the expected shape
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        /// Path of the state file
        path: PathBuf,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// File parsed but holds values the pipeline cannot trust
    #[error("state file {path} is invalid: {}", .errors.join("; "))]
    Invalid {
        /// Path of the state file
        path: PathBuf,
        /// Every validation failure found
        errors: Vec<String>,
    },
}

impl Error {
    /// Shorthand for a configuration error tied to a property path
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
