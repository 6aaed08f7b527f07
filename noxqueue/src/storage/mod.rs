//! Content-addressed artifact storage.
//!
//! Files are ingested by moving them under the storage root at a path
//! derived from their SHA-256, so identical content is stored once. Jobs
//! reference artifacts through `job_artifact` links; an artifact with no
//! remaining links is deleted together with its file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::database::models::{ArtifactDbModel, ArtifactRole};
use crate::database::repositories::ArtifactRepository;
use crate::database::time::now_ms;
use crate::{Error, Result};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// An artifact as attached to a particular job.
#[derive(Debug, Clone)]
pub struct AttachedArtifact {
    pub artifact: ArtifactDbModel,
    pub role: ArtifactRole,
    pub label: Option<String>,
}

/// What the lifecycle authority needs from storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Ingest the file at `path`, deduplicating by content checksum.
    ///
    /// The source file is consumed: it is moved into storage, or removed when
    /// identical content is already stored.
    async fn create_from_path(
        &self,
        path: &Path,
        kind: &str,
        name: &str,
        format: Option<&str>,
    ) -> Result<ArtifactDbModel>;
    async fn get(&self, artifact_id: &str) -> Result<ArtifactDbModel>;
    /// Absolute location of an artifact's content.
    fn resolve_path(&self, artifact: &ArtifactDbModel) -> PathBuf;
    async fn attach(
        &self,
        job_id: &str,
        artifact_id: &str,
        role: ArtifactRole,
        label: Option<&str>,
    ) -> Result<()>;
    /// Remove a link, deleting the artifact if nothing references it anymore.
    async fn detach(&self, job_id: &str, artifact_id: &str, role: ArtifactRole) -> Result<bool>;
    /// Attachments of a job, inputs first, each side in attachment order.
    async fn list_attached(
        &self,
        job_id: &str,
        role: Option<ArtifactRole>,
    ) -> Result<Vec<AttachedArtifact>>;
    /// Copy every attachment of `source_job_id` onto `target_job_id`.
    async fn clone_attachments(&self, source_job_id: &str, target_job_id: &str) -> Result<u64>;
    async fn delete_if_orphaned(&self, artifact_id: &str) -> Result<bool>;
}

/// Artifact store on the local filesystem.
pub struct LocalArtifactStore {
    root: PathBuf,
    repo: Arc<dyn ArtifactRepository>,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, repo: Arc<dyn ArtifactRepository>) -> Self {
        Self {
            root: root.into(),
            repo,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_path_for(checksum: &str, name: &str) -> String {
        let shard = checksum.get(..2).unwrap_or("00");
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) if !ext.is_empty() => format!("{shard}/{checksum}.{}", ext.to_lowercase()),
            _ => format!("{shard}/{checksum}"),
        }
    }

    async fn discard_source(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove duplicate source file");
        }
    }
}

/// Hex SHA-256 and size of a file.
pub async fn checksum_file(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Move `from` to `to`, falling back to copy + remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn create_from_path(
        &self,
        path: &Path,
        kind: &str,
        name: &str,
        format: Option<&str>,
    ) -> Result<ArtifactDbModel> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::storage(format!("Cannot read {}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(Error::storage(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let (checksum, size) = checksum_file(path).await?;

        if let Some(existing) = self.repo.find_by_checksum(&checksum).await? {
            debug!(artifact_id = %existing.id, "Deduplicated artifact by checksum");
            if self.resolve_path(&existing) != path {
                Self::discard_source(path).await;
            }
            return Ok(existing);
        }

        let relative = Self::relative_path_for(&checksum, name);
        let destination = self.root.join(&relative);
        move_file(path, &destination).await.map_err(|e| {
            Error::storage(format!(
                "Failed to move {} into storage: {e}",
                path.display()
            ))
        })?;

        let artifact = ArtifactDbModel {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            format: format.map(str::to_string),
            checksum: checksum.clone(),
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            path: relative,
            created_at: now_ms(),
        };

        match self.repo.create_artifact(&artifact).await {
            Ok(()) => Ok(artifact),
            Err(err) => {
                // Lost an ingest race on the same content: the winner's row
                // already points at the same destination.
                if let Some(existing) = self.repo.find_by_checksum(&checksum).await? {
                    return Ok(existing);
                }
                if let Err(e) = tokio::fs::remove_file(&destination).await {
                    warn!(path = %destination.display(), error = %e, "Failed to remove unrecorded artifact file");
                }
                Err(err)
            }
        }
    }

    async fn get(&self, artifact_id: &str) -> Result<ArtifactDbModel> {
        self.repo.get_artifact(artifact_id).await
    }

    fn resolve_path(&self, artifact: &ArtifactDbModel) -> PathBuf {
        self.root.join(&artifact.path)
    }

    async fn attach(
        &self,
        job_id: &str,
        artifact_id: &str,
        role: ArtifactRole,
        label: Option<&str>,
    ) -> Result<()> {
        self.repo.link(job_id, artifact_id, role, label).await
    }

    async fn detach(&self, job_id: &str, artifact_id: &str, role: ArtifactRole) -> Result<bool> {
        let removed = self.repo.unlink(job_id, artifact_id, role).await?;
        self.delete_if_orphaned(artifact_id).await?;
        Ok(removed)
    }

    async fn list_attached(
        &self,
        job_id: &str,
        role: Option<ArtifactRole>,
    ) -> Result<Vec<AttachedArtifact>> {
        let rows = self.repo.list_linked_artifacts(job_id).await?;
        let attached = rows
            .into_iter()
            .filter_map(|row| {
                let row_role = ArtifactRole::parse(&row.role)?;
                if role.is_some_and(|wanted| wanted != row_role) {
                    return None;
                }
                Some(AttachedArtifact {
                    artifact: row.artifact,
                    role: row_role,
                    label: row.label,
                })
            })
            .collect();
        Ok(attached)
    }

    async fn clone_attachments(&self, source_job_id: &str, target_job_id: &str) -> Result<u64> {
        self.repo.clone_links(source_job_id, target_job_id).await
    }

    async fn delete_if_orphaned(&self, artifact_id: &str) -> Result<bool> {
        if self.repo.count_links(artifact_id).await? > 0 {
            return Ok(false);
        }
        let artifact = match self.repo.get_artifact(artifact_id).await {
            Ok(artifact) => artifact,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let deleted = self.repo.delete_artifact(artifact_id).await?;
        if deleted {
            let path = self.resolve_path(&artifact);
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove orphaned artifact file");
            }
            debug!(artifact_id, "Deleted orphaned artifact");
        }
        Ok(deleted)
    }
}
