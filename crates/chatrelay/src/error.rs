//! Error types for chatrelay

use thiserror::Error;

/// Process-level error type for chatrelay
///
/// Anything surfaced through this type happens outside of a request, during
/// startup or shutdown. Request failures use [`crate::server::ApiError`].
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors (missing keys, unreadable files, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors (bind, serve)
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for chatrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
