#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc::error::TryRecvError;

use noxqueue::database::models::{
    AbortReason, ArtifactDbModel, JobDbModel, JobFilters, JobStatus, JobTool, Pagination,
};
use noxqueue::database::repositories::{JobRepository, SqlxArtifactRepository, SqlxJobRepository};
use noxqueue::database::{self, DbPool};
use noxqueue::jobs::{
    ExecutionContext, ExecutionOutcome, ExecutionResult, ExecutorRegistry, Job, JobCancellation,
    JobEvent, JobEventBus, JobExecutor, JobLifecycle, JobNotifier, JobSubmitter, JobSubscription,
    JobWorker, NewJob, OutputFile, WorkerConfig,
};
use noxqueue::storage::{ArtifactStore, LocalArtifactStore};
use noxqueue::{Error, Result};

/// A database, storage root and lifecycle authority in a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub pool: DbPool,
    pub events: Arc<JobEventBus>,
    pub store: Arc<LocalArtifactStore>,
    /// The repository behind `lifecycle`.
    pub jobs: Arc<HookedJobRepository>,
    pub lifecycle: Arc<JobLifecycle>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pool = database::test_init_pool(dir.path()).await.unwrap();
        let events = Arc::new(JobEventBus::new());
        let store = Arc::new(LocalArtifactStore::new(
            dir.path().join("files"),
            Arc::new(SqlxArtifactRepository::new(pool.clone())),
        ));
        let jobs = Arc::new(HookedJobRepository::new(pool.clone()));
        let lifecycle = Arc::new(JobLifecycle::new(
            jobs.clone(),
            store.clone(),
            events.clone(),
        ));
        Self {
            dir,
            pool,
            events,
            store,
            jobs,
            lifecycle,
        }
    }

    /// A repository on the same database that bypasses the hooks, standing in
    /// for a second process.
    pub fn other_process(&self) -> SqlxJobRepository {
        SqlxJobRepository::new(self.pool.clone())
    }

    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(self.lifecycle.clone())
    }

    pub fn worker_config(&self, worker_id: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.to_string(),
            poll_interval_ms: 50,
            watch_interval_ms: 100,
            shutdown_timeout_ms: 5000,
            work_dir: self.dir.path().join("work"),
            ..WorkerConfig::default()
        }
    }

    pub fn worker(&self, worker_id: &str, executors: ExecutorRegistry) -> Arc<JobWorker> {
        Arc::new(JobWorker::new(
            self.worker_config(worker_id),
            self.lifecycle.clone(),
            executors,
        ))
    }

    /// Insert a `PENDING` job whose params are `params`.
    pub async fn pending(&self, tool: JobTool, params: Value) -> Job {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let signature = format!("test:{}", uuid::Uuid::new_v4());
        self.lifecycle
            .create_job(NewJob::new(tool, params, signature))
            .await
            .unwrap()
    }

    /// Insert a job and move it to `RUNNING` under `worker_id`.
    pub async fn running(&self, worker_id: &str) -> Job {
        let job = self.pending(JobTool::Transcode, json!({})).await;
        self.lifecycle.mark_running(&job.id, worker_id).await.unwrap()
    }

    /// Store `content` as an artifact.
    pub async fn artifact(&self, name: &str, content: &[u8]) -> ArtifactDbModel {
        let path = self.scratch_file(name, content);
        let format = name.rsplit_once('.').map(|(_, ext)| ext);
        self.store
            .create_from_path(&path, "audio", name, format)
            .await
            .unwrap()
    }

    /// Write a loose file outside of storage.
    pub fn scratch_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let dir = self.dir.path().join("scratch").join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub async fn artifact_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM artifact")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    /// Poll until the job reaches `status`.
    pub async fn wait_for_status(&self, id: &str, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let job = self.lifecycle.get_job(id).await.unwrap();
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status}"))
    }
}

/// Job repository that can fail a chosen call once, or run extra work right
/// after it commits.
pub struct HookedJobRepository {
    inner: SqlxJobRepository,
    failures: Mutex<HashSet<&'static str>>,
    after: Mutex<HashMap<&'static str, BoxFuture<'static, ()>>>,
}

impl HookedJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self {
            inner: SqlxJobRepository::new(pool),
            failures: Mutex::new(HashSet::new()),
            after: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next call to `op` without touching the database.
    pub fn fail_next(&self, op: &'static str) {
        self.failures.lock().insert(op);
    }

    /// Run `work` once the next call to `op` has been applied.
    pub fn after_next(&self, op: &'static str, work: impl Future<Output = ()> + Send + 'static) {
        self.after.lock().insert(op, Box::pin(work));
    }

    async fn hooked<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if self.failures.lock().remove(op) {
            return Err(Error::Other(format!("injected {op} failure")));
        }
        let value = call.await?;
        let work = self.after.lock().remove(op);
        if let Some(work) = work {
            work.await;
        }
        Ok(value)
    }
}

#[async_trait]
impl JobRepository for HookedJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        self.inner.get_job(id).await
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>> {
        self.inner.find_job(id).await
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        self.hooked("create_job", self.inner.create_job(job)).await
    }

    async fn list_jobs_filtered(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<JobDbModel>, u64)> {
        self.inner.list_jobs_filtered(filters, pagination).await
    }

    async fn count_jobs(&self, filters: &JobFilters) -> Result<u64> {
        self.inner.count_jobs(filters).await
    }

    async fn list_jobs_by_signature(&self, signature: &str) -> Result<Vec<JobDbModel>> {
        self.inner.list_jobs_by_signature(signature).await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        self.inner.list_jobs_by_status(status).await
    }

    async fn find_claimable_job(&self, stale_before_ms: i64) -> Result<Option<JobDbModel>> {
        self.inner.find_claimable_job(stale_before_ms).await
    }

    async fn try_lock_job(
        &self,
        id: &str,
        worker_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool> {
        self.inner
            .try_lock_job(id, worker_id, now_ms, stale_before_ms)
            .await
    }

    async fn claim_next_pending_job(
        &self,
        worker_id: &str,
        stale_before_ms: i64,
    ) -> Result<Option<JobDbModel>> {
        self.inner
            .claim_next_pending_job(worker_id, stale_before_ms)
            .await
    }

    async fn release_lock(&self, id: &str, holder: &str) -> Result<bool> {
        self.hooked("release_lock", self.inner.release_lock(id, holder))
            .await
    }

    async fn mark_running(&self, id: &str, worker_id: &str) -> Result<bool> {
        self.hooked("mark_running", self.inner.mark_running(id, worker_id))
            .await
    }

    async fn mark_completed(&self, id: &str, result: &str) -> Result<bool> {
        self.hooked("mark_completed", self.inner.mark_completed(id, result))
            .await
    }

    async fn mark_error(&self, id: &str, message: &str) -> Result<bool> {
        self.hooked("mark_error", self.inner.mark_error(id, message))
            .await
    }

    async fn mark_aborted(&self, id: &str, reason: AbortReason, message: &str) -> Result<bool> {
        self.hooked("mark_aborted", self.inner.mark_aborted(id, reason, message))
            .await
    }

    async fn reset_for_retry(&self, id: &str) -> Result<bool> {
        self.hooked("reset_for_retry", self.inner.reset_for_retry(id))
            .await
    }

    async fn update_result(&self, id: &str, result: &str) -> Result<()> {
        self.inner.update_result(id, result).await
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        self.inner.delete_job(id).await
    }
}

/// Drain every event currently buffered for `subscription`.
pub fn drain(subscription: &mut JobSubscription) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        match subscription.receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return events,
        }
    }
}

pub fn subscribe(harness: &Harness) -> JobSubscription {
    harness.events.subscribe()
}

/// What a [`ScriptedExecutor`] does when invoked.
#[derive(Debug, Clone)]
pub enum Script {
    /// Write each `(name, content)` into the scratch dir and report it.
    Complete(Vec<(&'static str, &'static [u8])>),
    /// Report a file that does not exist after a real one.
    MissingOutput,
    Fail(&'static str),
    Panic(&'static str),
    /// Block until cancelled, then report cancellation.
    UntilCancelled,
}

/// Test executor with a fixed behavior and an invocation counter.
pub struct ScriptedExecutor {
    script: Script,
    calls: AtomicUsize,
    input_counts: parking_lot::Mutex<Vec<usize>>,
}

impl ScriptedExecutor {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            input_counts: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of readable inputs seen by each invocation.
    pub fn input_counts(&self) -> Vec<usize> {
        self.input_counts.lock().clone()
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &ExecutionContext, token: &JobCancellation) -> ExecutionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.input_counts
            .lock()
            .push(ctx.inputs.iter().filter(|i| i.path.is_file()).count());

        match &self.script {
            Script::Complete(files) => {
                std::fs::create_dir_all(&ctx.work_dir).unwrap();
                let outputs = files
                    .iter()
                    .map(|(name, content)| {
                        let path = ctx.work_dir.join(name);
                        std::fs::write(&path, content).unwrap();
                        OutputFile::new(path, "stem").with_label(name.to_string())
                    })
                    .collect();
                let mut summary = Map::new();
                summary.insert("files".into(), Value::from(files.len()));
                ExecutionOutcome::Completed(ExecutionResult {
                    summary,
                    outputs,
                    temp_paths: vec![ctx.work_dir.clone()],
                })
            }
            Script::MissingOutput => {
                std::fs::create_dir_all(&ctx.work_dir).unwrap();
                let real = ctx.work_dir.join("real.wav");
                std::fs::write(&real, b"real").unwrap();
                ExecutionOutcome::Completed(ExecutionResult {
                    summary: Map::new(),
                    outputs: vec![
                        OutputFile::new(real, "stem"),
                        OutputFile::new(ctx.work_dir.join("ghost.wav"), "stem"),
                    ],
                    temp_paths: vec![ctx.work_dir.clone()],
                })
            }
            Script::Fail(message) => ExecutionOutcome::failed(*message),
            Script::Panic(message) => panic!("{}", message),
            Script::UntilCancelled => {
                match tokio::time::timeout(Duration::from_secs(10), token.cancelled()).await {
                    Ok(()) => ExecutionOutcome::Cancelled,
                    Err(_) => ExecutionOutcome::failed("never cancelled"),
                }
            }
        }
    }
}

pub fn registry(tool: JobTool, executor: Arc<ScriptedExecutor>) -> ExecutorRegistry {
    ExecutorRegistry::new().with(tool, executor)
}
