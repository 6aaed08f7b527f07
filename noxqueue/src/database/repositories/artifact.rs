//! Artifact and job-link repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ArtifactDbModel, ArtifactRole, LinkedArtifactRow};
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn get_artifact(&self, id: &str) -> Result<ArtifactDbModel>;
    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<ArtifactDbModel>>;
    async fn create_artifact(&self, artifact: &ArtifactDbModel) -> Result<()>;
    async fn delete_artifact(&self, id: &str) -> Result<bool>;

    /// Link an artifact to a job. Re-linking the same `(job, artifact, role)`
    /// is a no-op.
    async fn link(
        &self,
        job_id: &str,
        artifact_id: &str,
        role: ArtifactRole,
        label: Option<&str>,
    ) -> Result<()>;
    async fn unlink(&self, job_id: &str, artifact_id: &str, role: ArtifactRole) -> Result<bool>;
    /// Links joined with their artifacts, inputs first.
    async fn list_linked_artifacts(&self, job_id: &str) -> Result<Vec<LinkedArtifactRow>>;
    async fn count_links(&self, artifact_id: &str) -> Result<u64>;
    /// Copy every link of `source_job_id` onto `target_job_id`.
    async fn clone_links(&self, source_job_id: &str, target_job_id: &str) -> Result<u64>;
}

/// SQLx implementation of ArtifactRepository.
pub struct SqlxArtifactRepository {
    pool: SqlitePool,
}

impl SqlxArtifactRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepository for SqlxArtifactRepository {
    async fn get_artifact(&self, id: &str) -> Result<ArtifactDbModel> {
        sqlx::query_as::<_, ArtifactDbModel>("SELECT * FROM artifact WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Artifact", id))
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<ArtifactDbModel>> {
        let artifact =
            sqlx::query_as::<_, ArtifactDbModel>("SELECT * FROM artifact WHERE checksum = ?")
                .bind(checksum)
                .fetch_optional(&self.pool)
                .await?;
        Ok(artifact)
    }

    async fn create_artifact(&self, artifact: &ArtifactDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifact (id, kind, name, format, checksum, size_bytes, path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.kind)
        .bind(&artifact.name)
        .bind(&artifact.format)
        .bind(&artifact.checksum)
        .bind(artifact.size_bytes)
        .bind(&artifact.path)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_artifact(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM artifact WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn link(
        &self,
        job_id: &str,
        artifact_id: &str,
        role: ArtifactRole,
        label: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_artifact (job_id, artifact_id, role, label, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(artifact_id)
        .bind(role.as_str())
        .bind(label)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unlink(&self, job_id: &str, artifact_id: &str, role: ArtifactRole) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM job_artifact WHERE job_id = ? AND artifact_id = ? AND role = ?",
        )
        .bind(job_id)
        .bind(artifact_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_linked_artifacts(&self, job_id: &str) -> Result<Vec<LinkedArtifactRow>> {
        let rows = sqlx::query_as::<_, LinkedArtifactRow>(
            r#"
            SELECT a.*, l.role AS role, l.label AS label
            FROM job_artifact l
            JOIN artifact a ON a.id = l.artifact_id
            WHERE l.job_id = ?
            ORDER BY CASE l.role WHEN 'input' THEN 0 ELSE 1 END, l.created_at ASC, l.rowid ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_links(&self, artifact_id: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_artifact WHERE artifact_id = ?")
                .bind(artifact_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn clone_links(&self, source_job_id: &str, target_job_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_artifact (job_id, artifact_id, role, label, created_at)
            SELECT ?, artifact_id, role, label, created_at
            FROM job_artifact
            WHERE job_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(target_job_id)
        .bind(source_job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
