//! Error types for the HTTP pipeline

use std::time::Duration;

use feedwire_cache::CacheError;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

/// Errors raised while sending requests or serving cached responses
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport-level failure (connection refused, reset, DNS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO failure, including stalled response bodies
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    /// No response headers arrived within the request timeout
    #[error("The HTTP request to '{url}' has timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Request URL
        url: Url,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The caller cancelled the operation
    #[error("The operation was cancelled")]
    Cancelled,

    /// The proxy rejected the request before a response was produced
    #[error("Proxy authentication required for '{url}'")]
    ProxyAuthenticationRequired {
        /// Request URL
        url: Url,
    },

    /// A response with a non-success status reached a path that needs success
    #[error("Response status code does not indicate success: {} ({}) for '{url}'", status.as_u16(), status.canonical_reason().unwrap_or("Unknown"))]
    HttpStatus {
        /// Response status
        status: StatusCode,
        /// Request URL
        url: Url,
    },

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Invalid header name or value
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Disk cache failure
    #[error("Cache error: {0}")]
    Cache(CacheError),

    /// Response body could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport could not be constructed
    #[error("Failed to create HTTP client: {0}")]
    ClientSetup(String),
}

impl ProtocolError {
    /// Check if the error is worth another attempt.
    ///
    /// Cancellation and caller mistakes are never retried.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_redirect(),
            Self::Io(_) | Self::Timeout { .. } => true,
            Self::Cache(e) => !e.is_cancelled(),
            // The proxy interceptor has already prompted, or given up
            Self::ProxyAuthenticationRequired { .. }
            | Self::Cancelled
            | Self::HttpStatus { .. }
            | Self::InvalidUrl(_)
            | Self::InvalidHeader(_)
            | Self::Parse(_)
            | Self::Config(_)
            | Self::ClientSetup(_) => false,
        }
    }

    /// Check if the error came from caller cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Cache(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

impl From<CacheError> for ProtocolError {
    fn from(err: CacheError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Cache(err)
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
