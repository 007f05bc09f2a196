//! Error types for blocksync

use thiserror::Error;

/// Result type alias for blocksync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for blocksync
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Caller-supplied arguments rejected at entry, before any side effect
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Manifest parsing or encoding errors
    #[error("manifest error: {message}")]
    Manifest { message: String },

    /// Fetch callback returned fewer bytes than a non-final block requires
    #[error("short fetch for block {block_index}: expected {expected} bytes, got {got}")]
    ShortFetch {
        block_index: i64,
        expected: usize,
        got: usize,
    },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create an invalid-argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Manifest {
            message: format!("JSON error: {}", err),
        }
    }
}
