//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Job database model.
///
/// One row per unit of work. `locked_at`/`locked_by` form the worker lease
/// and are only ever set while the job is `PENDING` (claimed) or `RUNNING`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub tool: String,
    /// PENDING, RUNNING, DONE, ERROR, ABORTED
    pub status: String,
    /// JSON object of tool parameters
    pub params: String,
    pub signature: String,
    /// JSON result payload, present once DONE
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub abort_reason: Option<String>,
    pub attempt: i64,
    pub max_attempts: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub locked_at: Option<i64>,
    pub locked_by: Option<String>,
}

impl JobDbModel {
    /// A fresh `PENDING` row with a random id.
    pub fn new(tool: JobTool, params: impl Into<String>, signature: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            params: params.into(),
            signature: signature.into(),
            result: None,
            error_message: None,
            abort_reason: None,
            attempt: 0,
            max_attempts: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            locked_at: None,
            locked_by: None,
        }
    }
}

/// Tools the queue knows how to dispatch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobTool {
    /// Re-encode a media file.
    Transcode,
    /// Split a track into stems.
    Separate,
    /// Fetch remote media.
    Download,
    /// Extract tempo, key and loudness.
    Analyze,
}

impl JobTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcode => "transcode",
            Self::Separate => "separate",
            Self::Download => "download",
            Self::Analyze => "analyze",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcode" => Some(Self::Transcode),
            "separate" => Some(Self::Separate),
            "download" => Some(Self::Download),
            "analyze" => Some(Self::Analyze),
            _ => None,
        }
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully; outputs are attached.
    Done,
    /// The executor reported a failure.
    Error,
    /// Stopped by cancellation, shutdown or crash recovery.
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "DONE" => Some(Self::Done),
            "ERROR" => Some(Self::Error),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Whether the job has reached a resting state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Aborted)
    }

    /// Whether the job still occupies its signature.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether an operator may send the job back to `PENDING`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Aborted)
    }
}

/// Why a running job was aborted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// An operator cancelled the job.
    UserCancelled,
    /// The worker stopped, or found the job orphaned at startup.
    Shutdown,
    /// Anything else.
    System,
}

/// What an abort records and cleans up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPolicy {
    pub message: &'static str,
    pub cleanup_outputs: bool,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCancelled => "user_cancelled",
            Self::Shutdown => "shutdown",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_cancelled" => Some(Self::UserCancelled),
            "shutdown" => Some(Self::Shutdown),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn policy(&self) -> AbortPolicy {
        match self {
            Self::UserCancelled => AbortPolicy {
                message: "Job cancelled by user",
                cleanup_outputs: true,
            },
            Self::Shutdown => AbortPolicy {
                message: "Job interrupted by server shutdown",
                cleanup_outputs: true,
            },
            Self::System => AbortPolicy {
                message: "Job aborted",
                cleanup_outputs: true,
            },
        }
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub tool: Option<JobTool>,
    pub status: Option<JobStatus>,
    pub signature: Option<String>,
}

impl JobFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: JobTool) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_new() {
        let job = JobDbModel::new(JobTool::Transcode, "{}", "v1:abc");
        assert_eq!(job.status, "PENDING");
        assert_eq!(job.tool, "transcode");
        assert_eq!(job.attempt, 0);
        assert!(job.locked_by.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_status_parse_matches_display() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Error,
            JobStatus::Aborted,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(JobStatus::parse("COMPLETED"), None);
    }

    #[test]
    fn test_status_classes() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(!JobStatus::Done.is_active());
        assert!(JobStatus::Aborted.is_retryable());
        assert!(!JobStatus::Done.is_retryable());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_tool_from_str() {
        assert_eq!(JobTool::from_str("separate").unwrap(), JobTool::Separate);
        assert_eq!(JobTool::parse("download"), Some(JobTool::Download));
        assert!(JobTool::from_str("Transcode").is_err());
    }

    #[test]
    fn test_abort_policies() {
        assert_eq!(
            AbortReason::UserCancelled.policy().message,
            "Job cancelled by user"
        );
        assert_eq!(
            AbortReason::Shutdown.policy().message,
            "Job interrupted by server shutdown"
        );
        assert_eq!(AbortReason::System.policy().message, "Job aborted");
        assert_eq!(
            AbortReason::from_str("user_cancelled").unwrap(),
            AbortReason::UserCancelled
        );
        assert_eq!(AbortReason::Shutdown.to_string(), "shutdown");
    }
}
