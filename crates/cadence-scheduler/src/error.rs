use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A create or update request was rejected before reaching the store.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The requested status change is not an edge of the job state machine.
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job is executing right now; edits must wait until it finishes.
    #[error("Job {id} is running and cannot be modified")]
    JobBusy { id: String },

    /// A persisted JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another thread panicked while holding the store connection.
    #[error("Job store lock poisoned")]
    StorePoisoned,
}

impl SchedulerError {
    /// Short error code string for CLI / API callers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::JobBusy { .. } => "JOB_BUSY",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::StorePoisoned => "STORE_POISONED",
        }
    }

    /// True when the whole store is unusable rather than one row being bad.
    ///
    /// The dispatch loop backs off on these instead of skipping a single job.
    pub fn is_store_outage(&self) -> bool {
        use rusqlite::ErrorCode;
        match self {
            SchedulerError::StorePoisoned => true,
            SchedulerError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
