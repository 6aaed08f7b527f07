//! Job repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::{AbortReason, JobDbModel, JobFilters, JobStatus, Pagination};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// How many candidates a single claim attempt walks before giving up.
const CLAIM_CANDIDATES: usize = 3;

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>>;
    /// Insert a new row. Fails with [`Error::DuplicateJob`] when the row is
    /// active and another active row already holds its signature.
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn list_jobs_filtered(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<JobDbModel>, u64)>;
    async fn count_jobs(&self, filters: &JobFilters) -> Result<u64>;
    /// All jobs sharing `signature`, oldest first.
    async fn list_jobs_by_signature(&self, signature: &str) -> Result<Vec<JobDbModel>>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>>;

    // Leasing
    /// Oldest `PENDING` job whose lease is absent or older than `stale_before_ms`.
    async fn find_claimable_job(&self, stale_before_ms: i64) -> Result<Option<JobDbModel>>;
    /// Conditionally take the lease on `id`. Returns false when another
    /// worker holds a fresh lease or the job left `PENDING`.
    async fn try_lock_job(
        &self,
        id: &str,
        worker_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool>;
    /// Find and lock the next eligible job for `worker_id`.
    async fn claim_next_pending_job(
        &self,
        worker_id: &str,
        stale_before_ms: i64,
    ) -> Result<Option<JobDbModel>>;

    /// Drop a lease on a `PENDING` job held by `holder`.
    async fn release_lock(&self, id: &str, holder: &str) -> Result<bool>;

    // Transitions
    async fn mark_running(&self, id: &str, worker_id: &str) -> Result<bool>;
    async fn mark_completed(&self, id: &str, result: &str) -> Result<bool>;
    async fn mark_error(&self, id: &str, message: &str) -> Result<bool>;
    async fn mark_aborted(&self, id: &str, reason: AbortReason, message: &str) -> Result<bool>;
    async fn reset_for_retry(&self, id: &str) -> Result<bool>;
    async fn update_result(&self, id: &str, result: &str) -> Result<()>;
    /// Delete a job that is not `RUNNING`. Returns false when nothing matched.
    async fn delete_job(&self, id: &str) -> Result<bool>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_active_by_signature(&self, signature: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE signature = ? AND status IN ('PENDING', 'RUNNING') LIMIT 1",
        )
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Translate a write error, resolving active-signature collisions to the
    /// job that holds the signature.
    async fn map_write_error(&self, err: sqlx::Error, signature: &str) -> Error {
        if !is_active_signature_violation(&err) {
            return err.into();
        }
        match self.find_active_by_signature(signature).await {
            Ok(Some(job)) => Error::DuplicateJob { job_id: job.id },
            _ => Error::conflict(format!(
                "Another active job already uses signature {signature}"
            )),
        }
    }
}

fn is_active_signature_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.message().contains("job.signature")
        }
        _ => false,
    }
}

fn push_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filters: &'a JobFilters) {
    qb.push(" WHERE 1 = 1");
    if let Some(tool) = filters.tool {
        qb.push(" AND tool = ").push_bind(tool.as_str());
    }
    if let Some(status) = filters.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(signature) = filters.signature.as_deref() {
        qb.push(" AND signature = ").push_bind(signature);
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        self.find_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job (
                id, tool, status, params, signature, result, error_message, abort_reason,
                attempt, max_attempts, created_at, updated_at, started_at, completed_at,
                locked_at, locked_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.tool)
        .bind(&job.status)
        .bind(&job.params)
        .bind(&job.signature)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.abort_reason)
        .bind(job.attempt)
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.locked_at)
        .bind(&job.locked_by)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) => Err(self.map_write_error(err, &job.signature).await),
        }
    }

    async fn list_jobs_filtered(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
    ) -> Result<(Vec<JobDbModel>, u64)> {
        let total = self.count_jobs(filters).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM job");
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::from(pagination.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(pagination.offset));

        let jobs = qb
            .build_query_as::<JobDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Ok((jobs, total))
    }

    async fn count_jobs(&self, filters: &JobFilters) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM job");
        push_filters(&mut qb, filters);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn list_jobs_by_signature(&self, signature: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE signature = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(signature)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn find_claimable_job(&self, stale_before_ms: i64) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE status = 'PENDING'
              AND (locked_at IS NULL OR locked_at <= ?)
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
            "#,
        )
        .bind(stale_before_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn try_lock_job(
        &self,
        id: &str,
        worker_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET locked_at = ?, locked_by = ?, updated_at = ?
            WHERE id = ?
              AND status = 'PENDING'
              AND (locked_at IS NULL OR locked_at <= ?)
            "#,
        )
        .bind(now_ms)
        .bind(worker_id)
        .bind(now_ms)
        .bind(id)
        .bind(stale_before_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_next_pending_job(
        &self,
        worker_id: &str,
        stale_before_ms: i64,
    ) -> Result<Option<JobDbModel>> {
        for _ in 0..CLAIM_CANDIDATES {
            let Some(candidate) = self.find_claimable_job(stale_before_ms).await? else {
                return Ok(None);
            };

            if self
                .try_lock_job(&candidate.id, worker_id, now_ms(), stale_before_ms)
                .await?
            {
                return self.find_job(&candidate.id).await;
            }
        }
        Ok(None)
    }

    async fn release_lock(&self, id: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET locked_at = NULL, locked_by = NULL, updated_at = ?
            WHERE id = ? AND status = 'PENDING' AND locked_by = ?
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_running(&self, id: &str, worker_id: &str) -> Result<bool> {
        let now = now_ms();
        // A PENDING row is promoted (and counts an attempt); a RUNNING row
        // already held by this worker only has its lease refreshed.
        let result = sqlx::query(
            r#"
            UPDATE job
            SET attempt = attempt + CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END,
                status = 'RUNNING',
                started_at = COALESCE(started_at, ?),
                locked_at = ?,
                locked_by = ?,
                updated_at = ?
            WHERE id = ?
              AND (
                (status = 'PENDING' AND (locked_by IS NULL OR locked_by = ?))
                OR (status = 'RUNNING' AND locked_by = ?)
              )
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(worker_id)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: &str, result: &str) -> Result<bool> {
        let now = now_ms();
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = 'DONE', result = ?, error_message = NULL, abort_reason = NULL,
                completed_at = ?, updated_at = ?, locked_at = NULL, locked_by = NULL
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(result)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_error(&self, id: &str, message: &str) -> Result<bool> {
        let now = now_ms();
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = 'ERROR', error_message = ?, result = NULL, abort_reason = NULL,
                completed_at = ?, updated_at = ?, locked_at = NULL, locked_by = NULL
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn mark_aborted(&self, id: &str, reason: AbortReason, message: &str) -> Result<bool> {
        let now = now_ms();
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = 'ABORTED', abort_reason = ?, error_message = ?, result = NULL,
                completed_at = ?, updated_at = ?, locked_at = NULL, locked_by = NULL
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(reason.as_str())
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn reset_for_retry(&self, id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE job
            SET status = 'PENDING', result = NULL, error_message = NULL, abort_reason = NULL,
                started_at = NULL, completed_at = NULL, locked_at = NULL, locked_by = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('ERROR', 'ABORTED')
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await;

        match updated {
            Ok(result) => Ok(result.rows_affected() == 1),
            Err(err) => {
                let signature = match self.find_job(id).await {
                    Ok(Some(job)) => job.signature,
                    _ => return Err(err.into()),
                };
                Err(self.map_write_error(err, &signature).await)
            }
        }
    }

    async fn update_result(&self, id: &str, result: &str) -> Result<()> {
        sqlx::query("UPDATE job SET result = ?, updated_at = ? WHERE id = ?")
            .bind(result)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job WHERE id = ? AND status != 'RUNNING'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::JobTool;
    use crate::database::test_init_pool;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlxJobRepository) {
        let dir = TempDir::new().unwrap();
        let pool = test_init_pool(dir.path()).await.unwrap();
        (dir, SqlxJobRepository::new(pool))
    }

    fn pending(signature: &str) -> JobDbModel {
        JobDbModel::new(JobTool::Transcode, "{}", signature)
    }

    #[tokio::test]
    async fn test_claim_is_fifo_with_rowid_tiebreak() {
        let (_dir, repo) = setup().await;
        let mut first = pending("sig-a");
        let mut second = pending("sig-b");
        second.created_at = first.created_at;
        second.updated_at = first.updated_at;
        first.id = "z-first".into();
        second.id = "a-second".into();
        repo.create_job(&first).await.unwrap();
        repo.create_job(&second).await.unwrap();

        let claimed = repo
            .claim_next_pending_job("w1", now_ms() - 300_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "z-first");
        assert_eq!(claimed.locked_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_fresh_lease_blocks_second_lock() {
        let (_dir, repo) = setup().await;
        let job = pending("sig");
        repo.create_job(&job).await.unwrap();
        let now = now_ms();
        let stale_before = now - 300_000;

        assert!(repo.try_lock_job(&job.id, "w1", now, stale_before).await.unwrap());
        assert!(!repo.try_lock_job(&job.id, "w2", now, stale_before).await.unwrap());
        assert!(
            repo.claim_next_pending_job("w2", stale_before)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimable() {
        let (_dir, repo) = setup().await;
        let job = pending("sig");
        repo.create_job(&job).await.unwrap();
        let now = now_ms();

        assert!(
            repo.try_lock_job(&job.id, "dead-worker", now - 600_000, now - 900_000)
                .await
                .unwrap()
        );

        let claimed = repo
            .claim_next_pending_job("w2", now - 300_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_mark_running_counts_attempt_once() {
        let (_dir, repo) = setup().await;
        let job = pending("sig");
        repo.create_job(&job).await.unwrap();
        repo.claim_next_pending_job("w1", now_ms() - 1).await.unwrap();

        assert!(repo.mark_running(&job.id, "w1").await.unwrap());
        let first = repo.get_job(&job.id).await.unwrap();
        assert_eq!(first.status, "RUNNING");
        assert_eq!(first.attempt, 1);

        // Lease refresh by the holder is allowed; other workers are not.
        assert!(repo.mark_running(&job.id, "w1").await.unwrap());
        assert!(!repo.mark_running(&job.id, "w2").await.unwrap());
        let refreshed = repo.get_job(&job.id).await.unwrap();
        assert_eq!(refreshed.attempt, 1);
        assert_eq!(refreshed.started_at, first.started_at);
    }

    #[tokio::test]
    async fn test_terminal_updates_require_running() {
        let (_dir, repo) = setup().await;
        let job = pending("sig");
        repo.create_job(&job).await.unwrap();

        assert!(!repo.mark_completed(&job.id, "{}").await.unwrap());
        assert!(!repo.mark_error(&job.id, "boom").await.unwrap());
        assert!(
            !repo
                .mark_aborted(&job.id, AbortReason::System, "Job aborted")
                .await
                .unwrap()
        );
        assert_eq!(repo.get_job(&job.id).await.unwrap().status, "PENDING");
    }

    #[tokio::test]
    async fn test_active_signature_is_unique() {
        let (_dir, repo) = setup().await;
        let first = pending("same");
        repo.create_job(&first).await.unwrap();

        let err = repo.create_job(&pending("same")).await.unwrap_err();
        match err {
            Error::DuplicateJob { job_id } => assert_eq!(job_id, first.id),
            other => panic!("unexpected error: {other:?}"),
        }

        let mut done = pending("same");
        done.status = JobStatus::Done.as_str().to_string();
        repo.create_job(&done).await.unwrap();
        assert_eq!(repo.list_jobs_by_signature("same").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_refuses_running() {
        let (_dir, repo) = setup().await;
        let job = pending("sig");
        repo.create_job(&job).await.unwrap();
        repo.claim_next_pending_job("w1", now_ms() - 1).await.unwrap();
        repo.mark_running(&job.id, "w1").await.unwrap();

        assert!(!repo.delete_job(&job.id).await.unwrap());
        repo.mark_error(&job.id, "boom").await.unwrap();
        assert!(repo.delete_job(&job.id).await.unwrap());
        assert!(repo.find_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_total() {
        let (_dir, repo) = setup().await;
        for i in 0..3 {
            repo.create_job(&pending(&format!("t-{i}"))).await.unwrap();
        }
        let analyze = JobDbModel::new(JobTool::Analyze, "{}", "a-0");
        repo.create_job(&analyze).await.unwrap();

        let filters = JobFilters::new().with_tool(JobTool::Transcode);
        let (page, total) = repo
            .list_jobs_filtered(&filters, &Pagination::new(2, 0))
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|j| j.tool == "transcode"));

        let all = repo.count_jobs(&JobFilters::default()).await.unwrap();
        assert_eq!(all, 4);
    }
}
