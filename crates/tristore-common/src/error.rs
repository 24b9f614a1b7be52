//! Error types for tristore.

use thiserror::Error;

/// Result type alias using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in tristore operations.
///
/// Lock-free retry loops never produce an error; everything here is either
/// resource exhaustion, malformed input, or a caller contract violation.
#[derive(Debug, Error)]
pub enum StoreError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Format errors
    #[error("Invalid input: cannot load {expected}: {reason}")]
    InvalidFormat { expected: String, reason: String },

    // Resource exhaustion
    #[error("Memory exhausted: {0}")]
    OutOfMemory(String),

    #[error("Memory budget exceeded: requested {requested} bytes, {available} available")]
    BudgetExceeded { requested: usize, available: usize },

    // Registry errors
    #[error("The maximum number of object IDs ({max}) exceeded")]
    ObjectIdsExhausted { max: usize },

    #[error("The maximum number of thread contexts ({max}) exceeded")]
    ThreadContextsExhausted { max: usize },

    // Argument errors
    #[error("A triple containing undefined values cannot be added to the store")]
    InvalidTriple,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Builds a format error for a component whose stream tag or body is wrong.
    pub fn invalid_format(expected: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidFormat {
            expected: expected.into(),
            reason: reason.into(),
        }
    }
}
