//! Error types for the trading simulator guard

use std::io;

use thiserror::Error;

/// Result type alias for the guard service
pub type Result<T> = std::result::Result<T, Error>;

/// Guard service errors
///
/// The cache and the rate limiter never produce these for normal use:
/// a cache miss is `None` and a rejection is a
/// [`RateLimitDecision`](crate::security::RateLimitDecision). These cover
/// the surrounding service (configuration, upstream data sources, I/O).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream market-data source failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an upstream error
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Whether retrying the failed operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Io(_))
    }
}
