//! Error types for Tollgate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The request can never be satisfied by the bucket's configuration
    #[error("requested {requested} tokens exceeds bucket capacity of {capacity}")]
    ExceedsCapacity {
        /// Tokens requested by the caller
        requested: u32,
        /// Configured bucket capacity
        capacity: f64,
    },

    /// The caller cancelled the wait
    #[error("wait cancelled")]
    Cancelled,

    /// The caller's deadline passed before tokens became available
    #[error("deadline exceeded while waiting for tokens")]
    DeadlineExceeded,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors surfaced outside of admission decisions
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from the caller's cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TollgateError::Cancelled | TollgateError::DeadlineExceeded)
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
