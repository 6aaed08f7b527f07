use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use noxqueue::config::AppConfig;
use noxqueue::database;
use noxqueue::database::models::JobStatus;
use noxqueue::database::repositories::{SqlxArtifactRepository, SqlxJobRepository};
use noxqueue::executors::CommandExecutor;
use noxqueue::jobs::{
    ExecutorRegistry, JobEventBus, JobEventKind, JobLifecycle, JobNotifier, JobWorker,
};
use noxqueue::logging;
use noxqueue::storage::LocalArtifactStore;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("Failed to initialize logging")?;
    let background = CancellationToken::new();
    logging_config.start_retention_cleanup(background.child_token());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    info!(database_url = %config.database_url, "Database ready");

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.storage_dir.display()))?;

    let artifacts = Arc::new(SqlxArtifactRepository::new(pool.clone()));
    let store = Arc::new(LocalArtifactStore::new(&config.storage_dir, artifacts));
    let events = Arc::new(JobEventBus::new());
    let lifecycle = Arc::new(JobLifecycle::new(
        Arc::new(SqlxJobRepository::new(pool.clone())),
        store,
        events.clone(),
    ));

    let mut executors = ExecutorRegistry::new();
    for (tool, template) in &config.commands {
        info!(tool = %tool, "Registered command executor");
        executors.register(*tool, Arc::new(CommandExecutor::for_tool(*tool, template.clone())));
    }
    if executors.is_empty() {
        warn!("No executors configured; claimed jobs will fail until NOXQUEUE_COMMAND_<TOOL> is set");
    }

    let worker = Arc::new(JobWorker::new(config.worker.clone(), lifecycle, executors));
    worker.start().await?;
    spawn_wakeup_listener(&events, &worker, background.child_token());

    info!(worker_id = %worker.worker_id(), "noxqueue started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    worker.stop(true).await;
    background.cancel();
    pool.close().await;

    info!("noxqueue stopped");
    Ok(())
}

/// Wake the worker whenever a job becomes claimable.
fn spawn_wakeup_listener(
    events: &Arc<JobEventBus>,
    worker: &Arc<JobWorker>,
    cancel: CancellationToken,
) {
    let mut subscription = events.subscribe();
    let worker = Arc::clone(worker);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.receiver.recv() => {
                    let Some(event) = event else { break };
                    let claimable = match event.kind {
                        JobEventKind::JobCreated | JobEventKind::JobUpdated => {
                            event.job.as_ref().is_some_and(|job| {
                                job.status == JobStatus::Pending && !job.is_locked()
                            })
                        }
                        JobEventKind::JobDeleted => false,
                    };
                    if claimable {
                        debug!(job_id = %event.job_id, "Waking worker for new job");
                        worker.wake();
                    }
                }
            }
        }
    });
}
