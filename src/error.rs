//! Error types for the function watcher

use thiserror::Error;

/// Result type alias for the function watcher
pub type Result<T> = std::result::Result<T, Error>;

/// Function watcher errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store could not be reached (pool closed or acquire timed out)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store operation failed after a connection was acquired
    #[error("Store error: {0}")]
    Store(String),

    /// A decision-logic invariant was broken
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invariant error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Whether the error comes from the shared store and may clear on its own.
    ///
    /// Transient errors degrade to conservative defaults; everything else is
    /// surfaced to the caller.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Store(_))
    }
}
