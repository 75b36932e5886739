//! Storage error types

use tally_core::error::TallyError;
use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Backend could not be reached or the write was lost
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Unique constraint or conditional update rejected the write
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for TallyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => TallyError::StorageUnavailable(msg),
            StorageError::Conflict(msg) => TallyError::Validation(msg),
            StorageError::NotFound(msg) => TallyError::NotFound(msg),
        }
    }
}
