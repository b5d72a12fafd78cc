//! Error types for the sync engine

use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the sync engine and its storage adapters
#[derive(Debug, Error)]
pub enum SyncError {
    /// Referenced batch, conflict or entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Mutation of a terminal batch or an already-resolved conflict
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed input, rejected before any batch is created
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A persisted row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The compare-and-swap write kept losing to concurrent writers
    #[error("write contention on {0}")]
    Contention(String),
}

impl SyncError {
    /// Whether retrying the whole request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Contention(_))
    }
}
