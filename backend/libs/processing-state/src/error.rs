//! Error types for the processing-state library

use thiserror::Error;

/// Result type for processing-state operations
pub type ProcessingStateResult<T> = Result<T, ProcessingStateError>;

/// Errors that can occur while recording or releasing a processing state.
///
/// An admission conflict is NOT an error: it is reported as
/// [`crate::AdmissionResult::AlreadyProcessing`].
#[derive(Error, Debug)]
pub enum ProcessingStateError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// User ID validation failed (empty, too long)
    #[error("Invalid user ID: {0}")]
    InvalidUserId(String),

    /// Admission kept racing with a concurrent finish and never settled
    #[error("Admission contention for user {0}")]
    Contention(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProcessingStateError {
    /// Check if error is transient (caller may retry the whole operation)
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessingStateError::Database(sqlx_err) => matches!(
                sqlx_err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            ProcessingStateError::Contention(_) => true,
            _ => false,
        }
    }
}
