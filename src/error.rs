//! Error types for the scheduler.

use thiserror::Error;

use crate::models::{JobId, QueueStatus};

/// Errors produced by the queue scheduler and its storage layer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient transaction conflict; the whole operation may be retried.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("unknown repository connection '{0}'")]
    UnknownConnection(String),

    #[error("no connector registered under '{0}'")]
    UnknownConnector(String),

    /// The job was paused, aborted, or is being deleted.
    #[error("job {0} is no longer active")]
    JobNotActive(JobId),

    #[error("job {job_id}: no queue entry for document {doc_hash}")]
    MissingEntry { job_id: JobId, doc_hash: String },

    #[error("job {job_id}: cannot {operation} document {doc_hash} in status {status:?}")]
    InvalidTransition {
        job_id: JobId,
        doc_hash: String,
        status: QueueStatus,
        operation: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking store call or worker task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        SchedulerError::Task(err.to_string())
    }
}

impl SchedulerError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Conflict(_) => true,
            SchedulerError::Database(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::SerializationFailure,
                _,
            )) => true,
            SchedulerError::Database(diesel::result::Error::DatabaseError(_, info)) => {
                let message = info.message();
                message.contains("database is locked") || message.contains("database is busy")
            }
            _ => false,
        }
    }

    /// Whether this error marks a broken queue invariant rather than an external failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SchedulerError::MissingEntry { .. } | SchedulerError::InvalidTransition { .. }
        )
    }
}

impl From<diesel::r2d2::PoolError> for SchedulerError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        SchedulerError::Pool(e.to_string())
    }
}

/// Result alias used across the crate.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_transient() {
        assert!(SchedulerError::Conflict("busy".into()).is_transient());
        assert!(!SchedulerError::UnknownJob(3).is_transient());
    }

    #[test]
    fn test_invariant_violation_classification() {
        let err = SchedulerError::MissingEntry {
            job_id: 1,
            doc_hash: "abc".into(),
        };
        assert!(err.is_invariant_violation());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("abc"));
    }
}
