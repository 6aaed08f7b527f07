//! Job worker.
//!
//! One polling loop per worker. Each iteration claims at most one eligible
//! job through a conditional lease update, drives it to `RUNNING`, runs the
//! registered executor inline and hands the outcome to the lifecycle
//! authority. While an executor runs, a watcher task polls the job row and
//! cancels the execution token as soon as someone else marks the job
//! `ABORTED`.
//!
//! Leases are time based. A worker that stalls for longer than the stale
//! threshold can lose its job to another worker without noticing until its
//! next guarded write; this is only safe with a single active worker process
//! or a store with atomic compare-and-set updates.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cancellation::JobCancellation;
use super::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry, InputFile};
use super::lifecycle::JobLifecycle;
use super::model::Job;
use crate::Result;
use crate::database::models::{AbortReason, ArtifactRole, JobStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

const UNFINALIZED_MESSAGE: &str = "Executor completed without finalizing job status";

/// Configuration for a job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identity written to `locked_by`.
    pub worker_id: String,
    /// Idle sleep between polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Age after which a lease on a `PENDING` job may be taken over.
    pub stale_lock_secs: u64,
    /// Abort watcher poll in milliseconds.
    pub watch_interval_ms: u64,
    /// How long `stop` waits for the loop to exit.
    pub shutdown_timeout_ms: u64,
    /// Parent of the per-job scratch directories.
    pub work_dir: PathBuf,
    /// Abort jobs left `RUNNING` by a previous process before polling.
    pub recover_on_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval_ms: 2000,
            stale_lock_secs: 300,
            watch_interval_ms: 500,
            shutdown_timeout_ms: 2000,
            work_dir: PathBuf::from("./data/work"),
            recover_on_start: true,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn stale_lock_ms(&self) -> i64 {
        i64::try_from(self.stale_lock_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

fn default_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

pub struct JobWorker {
    worker_id: String,
    config: WorkerConfig,
    lifecycle: Arc<JobLifecycle>,
    executors: ExecutorRegistry,
    shutdown: CancellationToken,
    abort_on_stop: AtomicBool,
    wakeup: Notify,
    active: DashMap<String, JobCancellation>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Deregisters a job's token and ends its watcher however processing ends.
struct ActiveJob<'a> {
    worker: &'a JobWorker,
    token: JobCancellation,
    watcher: Option<JoinHandle<()>>,
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.token.stop();
        self.worker.active.remove(self.token.job_id());
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl JobWorker {
    pub fn new(
        config: WorkerConfig,
        lifecycle: Arc<JobLifecycle>,
        executors: ExecutorRegistry,
    ) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            config,
            lifecycle,
            executors,
            shutdown: CancellationToken::new(),
            abort_on_stop: AtomicBool::new(false),
            wakeup: Notify::new(),
            active: DashMap::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ids of jobs this worker is executing right now.
    pub fn active_job_ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Cut the current idle sleep short.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Run startup recovery (if configured) and spawn the polling loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.task.lock().is_some() {
            warn!(worker_id = %self.worker_id, "Job worker already started");
            return Ok(());
        }

        if self.config.recover_on_start {
            self.lifecycle.recover_running_jobs().await?;
        }

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.run().await });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        info!(
            worker_id = %self.worker_id,
            tools = ?self.executors.tools(),
            "Job worker started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                // Drain the queue before sleeping again.
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(worker_id = %self.worker_id, error = %e, "Failed to poll for jobs"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!(worker_id = %self.worker_id, "Job worker stopped");
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let stale_before = now_ms().saturating_sub(self.config.stale_lock_ms());
        let repo = self.lifecycle.repository();
        let claimed = retry_on_sqlite_busy("claim_next_pending_job", || {
            repo.claim_next_pending_job(&self.worker_id, stale_before)
        })
        .await?;

        let Some(row) = claimed else {
            return Ok(false);
        };

        match Job::try_from(&row) {
            Ok(job) => self.process_job(job).await,
            Err(e) => {
                error!(job_id = %row.id, error = %e, "Claimed unreadable job record");
                let message = format!("Corrupt job record: {e}");
                if repo.mark_running(&row.id, &self.worker_id).await?
                    && !repo.mark_error(&row.id, &message).await?
                {
                    warn!(job_id = %row.id, "Failed to fail unreadable job record");
                }
            }
        }
        Ok(true)
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id.clone();

        if self.shutdown.is_cancelled() {
            // Claimed while stopping: hand the job back untouched.
            self.release_claim(&job_id).await;
            return;
        }

        let token = JobCancellation::new(job_id.as_str());
        self.active.insert(job_id.clone(), token.clone());
        let _active = ActiveJob {
            worker: self,
            token: token.clone(),
            watcher: Some(self.spawn_abort_watcher(token.clone())),
        };

        let job = match self.lifecycle.mark_running(&job_id, &self.worker_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, worker_id = %self.worker_id, error = %e, "Could not start claimed job");
                self.release_claim(&job_id).await;
                return;
            }
        };

        if self.abort_on_stop.load(Ordering::SeqCst) {
            token.cancel();
        }

        let outcome = self.execute(job, &token).await;
        self.finalize(&job_id, outcome).await;

        match self.lifecycle.find_job(&job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Running => {
                warn!(job_id = %job_id, "{}", UNFINALIZED_MESSAGE);
                if let Err(e) = self.lifecycle.mark_error(&job_id, UNFINALIZED_MESSAGE).await {
                    error!(job_id = %job_id, error = %e, "Failed to fail unfinalized job");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to re-read job after execution"),
        }
    }

    /// Drop the lease on a claimed job that never started.
    async fn release_claim(&self, job_id: &str) {
        match self
            .lifecycle
            .repository()
            .release_lock(job_id, &self.worker_id)
            .await
        {
            Ok(true) => debug!(job_id, worker_id = %self.worker_id, "Released claim"),
            Ok(false) => {}
            Err(e) => warn!(job_id, error = %e, "Failed to release claim"),
        }
    }

    async fn execute(&self, job: Job, token: &JobCancellation) -> ExecutionOutcome {
        let Some(executor) = self.executors.get(job.tool) else {
            return ExecutionOutcome::failed(format!(
                "No executor registered for tool '{}'",
                job.tool
            ));
        };

        let ctx = match self.build_context(job).await {
            Ok(ctx) => ctx,
            Err(e) => return ExecutionOutcome::failed(format!("Failed to resolve inputs: {e}")),
        };

        debug!(job_id = %ctx.job.id, tool = %ctx.job.tool, inputs = ctx.inputs.len(), "Dispatching job");

        match AssertUnwindSafe(executor.execute(&ctx, token))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job_id = %ctx.job.id, panic = %message, "Executor panicked");
                ExecutionOutcome::failed(format!("Executor panicked: {message}"))
            }
        }
    }

    async fn build_context(&self, job: Job) -> Result<ExecutionContext> {
        let store = self.lifecycle.store();
        let inputs = store
            .list_attached(&job.id, Some(ArtifactRole::Input))
            .await?
            .into_iter()
            .map(|entry| InputFile {
                path: store.resolve_path(&entry.artifact),
                artifact: entry.artifact,
                label: entry.label,
            })
            .collect();
        let work_dir = self.config.work_dir.join(&job.id);
        Ok(ExecutionContext {
            job,
            inputs,
            work_dir,
        })
    }

    async fn finalize(&self, job_id: &str, outcome: ExecutionOutcome) {
        let finalized = match outcome {
            ExecutionOutcome::Completed(result) => self.lifecycle.complete(job_id, result).await,
            ExecutionOutcome::Cancelled => {
                self.lifecycle
                    .abort_for_cancellation(job_id, self.shutdown.is_cancelled())
                    .await
            }
            ExecutionOutcome::Failed(message) => self.lifecycle.mark_error(job_id, &message).await,
        };

        match finalized {
            Ok(job) => debug!(job_id, status = %job.status, "Job finalized"),
            Err(e) => warn!(job_id, error = %e, "Failed to finalize job"),
        }
    }

    fn spawn_abort_watcher(&self, token: JobCancellation) -> JoinHandle<()> {
        let repo = Arc::clone(self.lifecycle.repository());
        let interval = self.config.watch_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.stopped() => return,
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                match repo.find_job(token.job_id()).await {
                    Ok(Some(row)) if row.status == JobStatus::Aborted.as_str() => {
                        info!(job_id = %token.job_id(), "Job aborted externally, cancelling execution");
                        token.cancel();
                        return;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(e) => debug!(job_id = %token.job_id(), error = %e, "Abort watcher poll failed"),
                }
            }
        })
    }

    /// Stop polling. With `abort_running`, active executions are cancelled
    /// and every `RUNNING` job is aborted with reason `shutdown`.
    pub async fn stop(&self, abort_running: bool) {
        info!(worker_id = %self.worker_id, abort_running, "Stopping job worker");

        if abort_running {
            self.abort_on_stop.store(true, Ordering::SeqCst);
        }
        self.shutdown.cancel();

        if abort_running {
            for entry in self.active.iter() {
                entry.value().cancel();
            }
            match self
                .lifecycle
                .abort_running_jobs(AbortReason::Shutdown)
                .await
            {
                Ok(aborted) if !aborted.is_empty() => {
                    info!(count = aborted.len(), "Aborted running jobs on shutdown");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to abort running jobs on shutdown"),
            }
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Job worker task ended abnormally"),
                Err(_) => warn!(
                    worker_id = %self.worker_id,
                    "Job worker did not stop within {:?}",
                    self.config.shutdown_timeout()
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.watch_interval(), Duration::from_millis(500));
        assert_eq!(config.stale_lock_ms(), 300_000);
        assert!(config.worker_id.starts_with("worker-"));
        assert_ne!(config.worker_id, WorkerConfig::default().worker_id);
    }

    #[test]
    fn test_stale_lock_ms_saturates() {
        let config = WorkerConfig {
            stale_lock_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.stale_lock_ms(), i64::MAX);
    }
}
