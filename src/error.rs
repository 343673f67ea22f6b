//! Crate-level error types.

use std::io;

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level errors surfaced by the binaries and service loops.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cryptographic material error.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}
