//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A job with the same signature is still pending or running.
    #[error("Job already running: {job_id}")]
    DuplicateJob { job_id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    /// Cooperative cancellation was observed. Resolves to `ABORTED`, never to
    /// a user-facing failure.
    #[error("Job cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error belongs to the conflict family (illegal transition,
    /// duplicate active signature, wrong-state admin operation).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InvalidStateTransition { .. } | Self::DuplicateJob { .. } | Self::Conflict(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_family() {
        assert!(Error::transition("DONE", "PENDING").is_conflict());
        assert!(
            Error::DuplicateJob {
                job_id: "a".into()
            }
            .is_conflict()
        );
        assert!(Error::conflict("Cannot delete a running job").is_conflict());
        assert!(!Error::validation("bad").is_conflict());
        assert!(!Error::Cancelled.is_conflict());
    }

    #[test]
    fn test_duplicate_message_references_job() {
        let err = Error::DuplicateJob {
            job_id: "job-1".into(),
        };
        assert_eq!(err.to_string(), "Job already running: job-1");
    }
}
