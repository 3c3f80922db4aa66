//! Error types for disk cache operations

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading, writing or locking cache entries
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error during cache operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Content rejected by the caller-supplied validator
    #[error("Content validation failed for {}: {reason}", path.display())]
    ContentValidationFailed {
        /// File that failed validation
        path: PathBuf,
        /// Validator message
        reason: String,
    },

    /// The cross-process lock for an entry could not be taken
    #[error("Failed to lock cache entry {}: {source}", path.display())]
    Lock {
        /// Cache file the lock guards
        path: PathBuf,
        /// Underlying lock error
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled by the caller
    #[error("Cache operation cancelled")]
    Cancelled,

    /// Blocking task failed to complete
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl CacheError {
    /// Whether this error came from caller cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Runtime(err.to_string())
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
