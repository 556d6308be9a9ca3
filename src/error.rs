//! Error types for the proxy configuration manager

use thiserror::Error;

/// Main error type for proxy configuration operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or unsupported proxy registration
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure to register a subscription against the cache
    #[error("watch error: {0}")]
    Watch(String),

    /// A delivered payload did not match the correlation id it arrived under
    #[error("schema error: {0}")]
    Schema(String),

    /// Synchronization against the remote authority failed
    #[error("sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a watch error with the given message
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    /// Create a schema error with the given message
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a sync error with the given message
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }
}
