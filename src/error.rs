//! Error types for the task tracker.

use crate::alert::AlertError;
use crate::store::StoreError;

/// Top-level error type for task tracking and deadline alerts.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Document store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No task with this id exists.
    #[error("task {id} not found")]
    NotFound { id: i64 },

    /// The alert for a task could not be delivered.
    #[error("alert for task {id} not delivered: {source}")]
    AlertDelivery {
        id: i64,
        #[source]
        source: AlertError,
    },

    /// User-supplied task fields are invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TrackerError>;
