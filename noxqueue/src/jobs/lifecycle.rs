//! Job lifecycle authority.
//!
//! The only component allowed to move a job between states:
//!
//! ```text
//! PENDING  --acquire--> RUNNING
//! RUNNING  --success--> DONE
//! RUNNING  --failure--> ERROR
//! RUNNING  --cancel --> ABORTED
//! ERROR    --retry  --> PENDING
//! ABORTED  --retry  --> PENDING
//! ```
//!
//! Each transition is one conditional update in the store. When it matches
//! nothing the row is re-read to tell a benign no-op (late success or failure
//! against an `ABORTED` job) from an illegal transition. Output attachments
//! only survive on `DONE` jobs; every other terminal transition detaches them.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::events::{JobEvent, JobNotifier};
use super::executor::{ExecutionResult, OutputFile};
use super::model::{Job, JobPage};
use crate::database::models::{
    AbortReason, ArtifactRole, JobDbModel, JobFilters, JobStatus, JobTool, Pagination,
};
use crate::database::repositories::JobRepository;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::storage::ArtifactStore;
use crate::{Error, Result};

/// Parameters for a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-chosen id; a random UUID when absent.
    pub id: Option<String>,
    pub tool: JobTool,
    pub params: Map<String, Value>,
    pub signature: String,
    pub max_attempts: u32,
    /// Create the row already leased to this holder so no worker claims it
    /// until [`JobLifecycle::release_hold`] is called.
    pub held_by: Option<String>,
}

impl NewJob {
    pub fn new(tool: JobTool, params: Map<String, Value>, signature: impl Into<String>) -> Self {
        Self {
            id: None,
            tool,
            params,
            signature: signature.into(),
            max_attempts: 1,
            held_by: None,
        }
    }

    pub fn held_by(mut self, holder: impl Into<String>) -> Self {
        self.held_by = Some(holder.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn into_row(self) -> Result<JobDbModel> {
        let params = serde_json::to_string(&Value::Object(self.params))?;
        let mut row = JobDbModel::new(self.tool, params, self.signature);
        if let Some(id) = self.id {
            row.id = id;
        }
        row.max_attempts = i64::from(self.max_attempts.max(1));
        if let Some(holder) = self.held_by {
            row.locked_at = Some(row.created_at);
            row.locked_by = Some(holder);
        }
        Ok(row)
    }
}

pub struct JobLifecycle {
    jobs: Arc<dyn JobRepository>,
    store: Arc<dyn ArtifactStore>,
    notifier: Arc<dyn JobNotifier>,
}

impl JobLifecycle {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        store: Arc<dyn ArtifactStore>,
        notifier: Arc<dyn JobNotifier>,
    ) -> Self {
        Self {
            jobs,
            store,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        Job::try_from(self.jobs.get_job(id).await?)
    }

    pub async fn find_job(&self, id: &str) -> Result<Option<Job>> {
        self.jobs.find_job(id).await?.map(Job::try_from).transpose()
    }

    /// Newest first.
    pub async fn list_jobs(&self, filters: &JobFilters, pagination: &Pagination) -> Result<JobPage> {
        let (rows, total) = self.jobs.list_jobs_filtered(filters, pagination).await?;
        let items = rows.iter().map(Job::try_from).collect::<Result<Vec<_>>>()?;
        Ok(JobPage {
            items,
            total,
            limit: pagination.limit,
            offset: pagination.offset,
        })
    }

    pub async fn count_jobs(&self, filters: &JobFilters) -> Result<u64> {
        self.jobs.count_jobs(filters).await
    }

    /// All jobs sharing `signature`, oldest first.
    pub async fn jobs_with_signature(&self, signature: &str) -> Result<Vec<Job>> {
        self.jobs
            .list_jobs_by_signature(signature)
            .await?
            .iter()
            .map(Job::try_from)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------------

    /// Insert a fresh `PENDING` job.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let row = new.into_row()?;
        self.jobs.create_job(&row).await?;
        let job = Job::try_from(&row)?;
        info!(job_id = %job.id, tool = %job.tool, "Job created");
        self.notifier.publish(JobEvent::created(&job));
        Ok(job)
    }

    /// Release a hold taken with `NewJob::held_by`. The job becomes
    /// claimable and an update is published.
    pub async fn release_hold(&self, id: &str, holder: &str) -> Result<()> {
        if !self.jobs.release_lock(id, holder).await? {
            debug!(job_id = %id, holder, "Hold already released or reclaimed");
            return Ok(());
        }
        let job = self.get_job(id).await?;
        self.publish_updated(&job);
        Ok(())
    }

    /// Create an already-`DONE` job that shares `source`'s attachments and
    /// summary. No executor runs for it.
    pub async fn create_done_clone(&self, source: &Job, new: NewJob) -> Result<Job> {
        let mut row = new.into_row()?;
        let now = now_ms();
        row.locked_at = None;
        row.locked_by = None;
        row.status = JobStatus::Done.as_str().to_string();
        row.started_at = Some(now);
        row.completed_at = Some(now);
        self.jobs.create_job(&row).await?;

        match self.populate_clone(source, &row.id).await {
            Ok(job) => {
                info!(job_id = %job.id, source_job_id = %source.id, "Job satisfied from completed duplicate");
                self.notifier.publish(JobEvent::created(&job));
                Ok(job)
            }
            Err(e) => {
                warn!(job_id = %row.id, error = %e, "Failed to clone completed job, removing partial row");
                if let Err(cleanup) = self.jobs.delete_job(&row.id).await {
                    warn!(job_id = %row.id, error = %cleanup, "Failed to remove partial clone");
                }
                Err(e)
            }
        }
    }

    async fn populate_clone(&self, source: &Job, target_id: &str) -> Result<Job> {
        self.store.clone_attachments(&source.id, target_id).await?;
        let summary = source.summary().cloned().unwrap_or_default();
        let result = self.build_result(target_id, summary).await?;
        self.jobs
            .update_result(target_id, &serde_json::to_string(&result)?)
            .await?;
        self.get_job(target_id).await
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// `PENDING -> RUNNING` for the lease holder, or a lease refresh when the
    /// same worker already runs it.
    pub async fn mark_running(&self, id: &str, worker_id: &str) -> Result<Job> {
        if retry_on_sqlite_busy("mark_running", || self.jobs.mark_running(id, worker_id)).await? {
            let job = self.get_job(id).await?;
            debug!(job_id = %id, worker_id, attempt = job.attempt, "Job running");
            self.publish_updated(&job);
            return Ok(job);
        }

        let current = self.get_job(id).await?;
        match current.status {
            JobStatus::Pending | JobStatus::Running => Err(Error::conflict(format!(
                "Job {id} is leased by {}",
                current.locked_by.as_deref().unwrap_or("another worker")
            ))),
            status => Err(Error::transition(status, JobStatus::Running)),
        }
    }

    /// `RUNNING -> DONE` with the aggregated result of whatever is attached.
    ///
    /// A job that was aborted meanwhile is returned unchanged.
    pub async fn mark_completed(&self, id: &str, summary: Map<String, Value>) -> Result<Job> {
        let result = serde_json::to_string(&self.build_result(id, summary).await?)?;
        if retry_on_sqlite_busy("mark_completed", || self.jobs.mark_completed(id, &result)).await? {
            let job = self.get_job(id).await?;
            info!(job_id = %id, "Job completed");
            self.publish_updated(&job);
            return Ok(job);
        }

        let current = self.get_job(id).await?;
        match current.status {
            JobStatus::Aborted => {
                debug!(job_id = %id, "Ignoring completion of aborted job");
                Ok(current)
            }
            status => Err(Error::transition(status, JobStatus::Done)),
        }
    }

    /// Persist an executor's outputs and complete the job, all or nothing.
    ///
    /// If any output cannot be stored, the outputs attached so far are
    /// detached, the job goes to `ERROR` and a storage error is returned.
    /// Temp paths are removed in every case.
    pub async fn complete(&self, id: &str, result: ExecutionResult) -> Result<Job> {
        let ExecutionResult {
            summary,
            outputs,
            temp_paths,
        } = result;
        let outcome = self.complete_inner(id, summary, &outputs).await;
        remove_temp_paths(&temp_paths).await;
        outcome
    }

    async fn complete_inner(
        &self,
        id: &str,
        summary: Map<String, Value>,
        outputs: &[OutputFile],
    ) -> Result<Job> {
        let current = self.get_job(id).await?;
        match current.status {
            JobStatus::Running => {}
            JobStatus::Aborted => {
                debug!(job_id = %id, "Discarding outputs of aborted job");
                return Ok(current);
            }
            status => return Err(Error::transition(status, JobStatus::Done)),
        }

        let attached = match self.attach_outputs(id, outputs).await {
            Ok(attached) => attached,
            Err(e) => {
                let message = format!("Failed to store outputs: {e}");
                self.fail_after_storage_error(id, &message).await;
                return Err(Error::storage(message));
            }
        };

        match self.mark_completed(id, summary).await {
            Ok(job) if job.status == JobStatus::Aborted => {
                // Aborted between the status check and the update.
                self.detach_outputs(id, &attached).await;
                Ok(job)
            }
            Ok(job) => Ok(job),
            Err(e) => {
                self.detach_outputs(id, &attached).await;
                let message = format!("Failed to store outputs: {e}");
                self.fail_after_storage_error(id, &message).await;
                Err(Error::storage(message))
            }
        }
    }

    /// Ingest and attach outputs in order. On failure everything attached by
    /// this call is detached again before the error is returned.
    async fn attach_outputs(&self, id: &str, outputs: &[OutputFile]) -> Result<Vec<String>> {
        let mut attached = Vec::with_capacity(outputs.len());
        for output in outputs {
            let step = async {
                let artifact = self
                    .store
                    .create_from_path(
                        &output.path,
                        &output.kind,
                        &output.name,
                        output.format.as_deref(),
                    )
                    .await?;
                self.store
                    .attach(id, &artifact.id, ArtifactRole::Output, output.label.as_deref())
                    .await?;
                Ok::<_, Error>(artifact.id)
            };
            match step.await {
                Ok(artifact_id) => attached.push(artifact_id),
                Err(e) => {
                    warn!(job_id = %id, path = %output.path.display(), error = %e, "Failed to attach output");
                    self.detach_outputs(id, &attached).await;
                    return Err(e);
                }
            }
        }
        Ok(attached)
    }

    async fn fail_after_storage_error(&self, id: &str, message: &str) {
        if let Err(e) = self.mark_error(id, message).await {
            warn!(job_id = %id, error = %e, "Failed to mark job as errored after storage failure");
        }
    }

    /// `RUNNING -> ERROR`. A job that was aborted meanwhile is returned
    /// unchanged.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<Job> {
        // Links made after the update belong to a later attempt.
        let outputs = self.output_ids(id).await;
        if retry_on_sqlite_busy("mark_error", || self.jobs.mark_error(id, message)).await? {
            self.detach_outputs(id, &outputs).await;
            let job = self.get_job(id).await?;
            warn!(job_id = %id, error = message, "Job failed");
            self.publish_updated(&job);
            return Ok(job);
        }

        let current = self.get_job(id).await?;
        match current.status {
            JobStatus::Aborted => {
                debug!(job_id = %id, "Ignoring failure of aborted job");
                Ok(current)
            }
            status => Err(Error::transition(status, JobStatus::Error)),
        }
    }

    /// `RUNNING -> ABORTED`, applying the reason's cleanup policy.
    pub async fn abort(&self, id: &str, reason: AbortReason) -> Result<Job> {
        let policy = reason.policy();
        let outputs = if policy.cleanup_outputs {
            self.output_ids(id).await
        } else {
            Vec::new()
        };
        if retry_on_sqlite_busy("mark_aborted", || {
            self.jobs.mark_aborted(id, reason, policy.message)
        })
        .await?
        {
            self.detach_outputs(id, &outputs).await;
            let job = self.get_job(id).await?;
            info!(job_id = %id, reason = %reason, "Job aborted");
            self.publish_updated(&job);
            return Ok(job);
        }

        let current = self.get_job(id).await?;
        Err(Error::transition(current.status, JobStatus::Aborted))
    }

    /// Abort only if the job is still `RUNNING`; otherwise return it as is.
    pub async fn abort_if_running(&self, id: &str, reason: AbortReason) -> Result<Job> {
        let current = self.get_job(id).await?;
        if current.status != JobStatus::Running {
            return Ok(current);
        }
        match self.abort(id, reason).await {
            Ok(job) => Ok(job),
            // Left RUNNING between the read and the update.
            Err(e) if e.is_conflict() => self.get_job(id).await,
            Err(e) => Err(e),
        }
    }

    /// Resolve an executor's cancellation outcome.
    pub async fn abort_for_cancellation(&self, id: &str, shutdown_requested: bool) -> Result<Job> {
        let reason = if shutdown_requested {
            AbortReason::Shutdown
        } else {
            AbortReason::UserCancelled
        };
        self.abort_if_running(id, reason).await
    }

    /// Abort every `RUNNING` job. Returns the ids that were aborted.
    pub async fn abort_running_jobs(&self, reason: AbortReason) -> Result<Vec<String>> {
        let running = self.jobs.list_jobs_by_status(JobStatus::Running).await?;
        let mut aborted = Vec::with_capacity(running.len());
        for row in running {
            match self.abort(&row.id, reason).await {
                Ok(_) => aborted.push(row.id),
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %row.id, "Job left RUNNING before it could be aborted");
                }
                Err(e) => warn!(job_id = %row.id, error = %e, "Failed to abort running job"),
            }
        }
        Ok(aborted)
    }

    /// Startup recovery: a job found `RUNNING` belongs to a process that no
    /// longer exists, so it is aborted instead of resumed.
    pub async fn recover_running_jobs(&self) -> Result<Vec<String>> {
        let recovered = self.abort_running_jobs(AbortReason::Shutdown).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Aborted jobs orphaned by a previous run");
        }
        Ok(recovered)
    }

    /// `ERROR | ABORTED -> PENDING`. Inputs and attempt count are kept.
    pub async fn retry(&self, id: &str) -> Result<Job> {
        let current = self.get_job(id).await?;
        if !current.status.is_retryable() {
            return Err(retry_conflict(id, current.status));
        }

        // Once reset the job is claimable, so leftovers go first.
        self.cleanup_outputs(id).await;
        if !self.jobs.reset_for_retry(id).await? {
            let current = self.get_job(id).await?;
            return Err(retry_conflict(id, current.status));
        }
        let job = self.get_job(id).await?;
        info!(job_id = %id, attempt = job.attempt, "Job queued for retry");
        self.publish_updated(&job);
        Ok(job)
    }

    /// Administrative delete of a job that is not `RUNNING`, together with
    /// any artifacts only it referenced.
    pub async fn delete_job_and_artifacts(&self, id: &str) -> Result<()> {
        let current = self.get_job(id).await?;
        if current.status == JobStatus::Running {
            return Err(Error::conflict("Cannot delete a running job"));
        }

        let attached = self.store.list_attached(id, None).await?;
        if !self.jobs.delete_job(id).await? {
            return match self.jobs.find_job(id).await? {
                Some(_) => Err(Error::conflict("Cannot delete a running job")),
                None => Err(Error::not_found("Job", id)),
            };
        }

        for entry in attached {
            if let Err(e) = self.store.delete_if_orphaned(&entry.artifact.id).await {
                warn!(job_id = %id, artifact_id = %entry.artifact.id, error = %e, "Failed to remove orphaned artifact");
            }
        }

        info!(job_id = %id, "Job deleted");
        self.notifier.publish(JobEvent::deleted(id));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Result payload and cleanup
    // ---------------------------------------------------------------------

    /// `{"summary": {...}, "files": [...]}` with inputs listed first.
    pub async fn build_result(&self, job_id: &str, summary: Map<String, Value>) -> Result<Value> {
        let files: Vec<Value> = self
            .store
            .list_attached(job_id, None)
            .await?
            .into_iter()
            .map(|entry| {
                json!({
                    "artifact": {
                        "id": entry.artifact.id,
                        "kind": entry.artifact.kind,
                        "name": entry.artifact.name,
                        "format": entry.artifact.format,
                        "checksum": entry.artifact.checksum,
                        "size_bytes": entry.artifact.size_bytes,
                    },
                    "role": entry.role,
                    "label": entry.label,
                })
            })
            .collect();

        Ok(json!({ "summary": summary, "files": files }))
    }

    /// Detach every output of `job_id`. Failures are logged, never raised.
    async fn output_ids(&self, job_id: &str) -> Vec<String> {
        match self.store.list_attached(job_id, Some(ArtifactRole::Output)).await {
            Ok(outputs) => outputs.into_iter().map(|o| o.artifact.id).collect(),
            Err(e) => {
                warn!(job_id, error = %e, "Failed to list outputs for cleanup");
                Vec::new()
            }
        }
    }

    async fn cleanup_outputs(&self, job_id: &str) {
        let ids = self.output_ids(job_id).await;
        self.detach_outputs(job_id, &ids).await;
    }

    async fn detach_outputs(&self, job_id: &str, artifact_ids: &[String]) {
        for artifact_id in artifact_ids {
            if let Err(e) = self
                .store
                .detach(job_id, artifact_id, ArtifactRole::Output)
                .await
            {
                warn!(job_id, artifact_id = %artifact_id, error = %e, "Failed to detach output");
            }
        }
    }

    fn publish_updated(&self, job: &Job) {
        self.notifier.publish(JobEvent::updated(job));
    }
}

fn retry_conflict(id: &str, status: JobStatus) -> Error {
    Error::conflict(format!(
        "Only errored or aborted jobs can be retried (job {id} is {status})"
    ))
}

/// Remove executor scratch paths. Missing paths are fine; other failures are
/// logged.
pub async fn remove_temp_paths(paths: &[PathBuf]) {
    for path in paths {
        let removed = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => debug!(path = %path.display(), "Removed temp path"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp path"),
        }
    }
}
