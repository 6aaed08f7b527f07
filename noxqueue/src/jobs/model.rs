//! Domain view of a job row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::database::models::{AbortReason, JobDbModel, JobStatus, JobTool};
use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// A job as seen by the lifecycle authority, workers and executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tool: JobTool,
    pub status: JobStatus,
    /// Tool parameters, passed verbatim to the executor.
    pub params: Map<String, Value>,
    pub signature: String,
    /// Aggregated result payload once `DONE`.
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub abort_reason: Option<AbortReason>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

impl Job {
    /// Whether a worker currently holds the lease.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some() || self.locked_by.is_some()
    }

    /// The `summary` object of the result payload, if any.
    pub fn summary(&self) -> Option<&Map<String, Value>> {
        self.result
            .as_ref()
            .and_then(|r| r.get("summary"))
            .and_then(Value::as_object)
    }
}

impl TryFrom<&JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: &JobDbModel) -> Result<Self> {
        let tool = JobTool::parse(&row.tool)
            .ok_or_else(|| Error::Other(format!("job {} has unknown tool '{}'", row.id, row.tool)))?;
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            Error::Other(format!("job {} has unknown status '{}'", row.id, row.status))
        })?;
        let params = match serde_json::from_str::<Value>(&row.params)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Other(format!(
                    "job {} has non-object params: {other}",
                    row.id
                )));
            }
        };
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;

        Ok(Self {
            id: row.id.clone(),
            tool,
            status,
            params,
            signature: row.signature.clone(),
            result,
            error_message: row.error_message.clone(),
            abort_reason: row.abort_reason.as_deref().and_then(AbortReason::parse),
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            started_at: row.started_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
            locked_at: row.locked_at.map(ms_to_datetime),
            locked_by: row.locked_by.clone(),
        })
    }
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        Self::try_from(&row)
    }
}

/// One page of jobs plus the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion() {
        let mut row = JobDbModel::new(JobTool::Separate, r#"{"stems":4}"#, "v1:x");
        row.result = Some(r#"{"summary":{"bpm":120},"files":[]}"#.to_string());
        row.abort_reason = Some("shutdown".to_string());

        let job = Job::try_from(&row).unwrap();
        assert_eq!(job.tool, JobTool::Separate);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.params["stems"], 4);
        assert_eq!(job.abort_reason, Some(AbortReason::Shutdown));
        assert_eq!(job.summary().unwrap()["bpm"], 120);
        assert!(!job.is_locked());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let mut row = JobDbModel::new(JobTool::Analyze, "{}", "v1:x");
        row.status = "COMPLETED".into();
        assert!(Job::try_from(&row).is_err());
    }
}
