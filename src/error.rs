//! Error types for slidegate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Missing or unset scope, unknown scope, or unreadable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A rate string that is not of the form `<count>/<unit>`
    #[error("Malformed rate {rate:?}: {reason}")]
    MalformedRate { rate: String, reason: String },

    /// Errors raised by the history store, passed through untouched
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An atomic check lost every compare-and-set race it attempted
    #[error("Gave up on {key} after {attempts} contended attempts")]
    Contention { key: String, attempts: u32 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlidegateError {
    pub(crate) fn malformed(rate: &str, reason: impl Into<String>) -> Self {
        SlidegateError::MalformedRate {
            rate: rate.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
