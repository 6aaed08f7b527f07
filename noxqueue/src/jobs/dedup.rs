//! Submission path with signature-based deduplication.
//!
//! A submission resolves against existing jobs with the same signature:
//!
//! 1. an active (`PENDING`/`RUNNING`) job rejects it with
//!    [`Error::DuplicateJob`];
//! 2. otherwise a `DONE` job is cloned into a new `DONE` job without running
//!    anything;
//! 3. otherwise a fresh `PENDING` job is created.
//!
//! The partial unique index on active signatures backs step 1 against
//! concurrent submitters.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::lifecycle::{JobLifecycle, NewJob};
use super::model::Job;
use super::signature::{InputFingerprint, build_signature, normalize_url};
use crate::database::models::{ArtifactRole, JobStatus, JobTool};
use crate::{Error, Result};

/// Lease holder used while a new job's inputs are being bound.
const SUBMITTER_HOLD: &str = "submitter";

/// What a job consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInput {
    /// A stored artifact, bound to the job with role `input`.
    Artifact {
        artifact_id: String,
        label: Option<String>,
    },
    /// A remote URL; normalized and passed to the executor as `params.url`.
    Url(String),
    None,
}

impl JobInput {
    pub fn artifact(artifact_id: impl Into<String>) -> Self {
        Self::Artifact {
            artifact_id: artifact_id.into(),
            label: None,
        }
    }

    pub fn labelled(artifact_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Artifact {
            artifact_id: artifact_id.into(),
            label: Some(label.into()),
        }
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    /// The completed job whose results were reused, if any.
    pub duplicate_of: Option<String>,
}

impl Submission {
    pub fn is_cached(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// Existing jobs relevant to a signature.
#[derive(Debug, Clone, Default)]
pub struct SignatureMatches {
    pub active: Option<Job>,
    /// Most recently created `DONE` job.
    pub done: Option<Job>,
}

pub struct JobSubmitter {
    lifecycle: Arc<JobLifecycle>,
}

impl JobSubmitter {
    pub fn new(lifecycle: Arc<JobLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub async fn find_signature_matches(&self, signature: &str) -> Result<SignatureMatches> {
        let mut matches = SignatureMatches::default();
        for job in self.lifecycle.jobs_with_signature(signature).await? {
            match job.status {
                JobStatus::Pending | JobStatus::Running => {
                    if matches.active.is_none() {
                        matches.active = Some(job);
                    }
                }
                JobStatus::Done => matches.done = Some(job),
                JobStatus::Error | JobStatus::Aborted => {}
            }
        }
        Ok(matches)
    }

    /// Submit `tool` over `input` with `params` (a JSON object or null).
    pub async fn submit(&self, tool: JobTool, params: Value, input: JobInput) -> Result<Submission> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::validation(format!(
                    "params must be a JSON object, got {other}"
                )));
            }
        };

        let fingerprint = match &input {
            JobInput::Artifact { artifact_id, .. } => {
                let artifact = match self.lifecycle.store().get(artifact_id).await {
                    Ok(artifact) => artifact,
                    Err(e) if e.is_not_found() => {
                        return Err(Error::validation(format!(
                            "Unknown input artifact {artifact_id}"
                        )));
                    }
                    Err(e) => return Err(e),
                };
                InputFingerprint::Checksum(artifact.checksum)
            }
            JobInput::Url(raw) => {
                let url = normalize_url(raw)?;
                params.insert("url".to_string(), Value::from(url.clone()));
                InputFingerprint::Url(url)
            }
            JobInput::None => InputFingerprint::None,
        };

        let signature = build_signature(tool, &params, &fingerprint);
        let matches = self.find_signature_matches(&signature).await?;

        if let Some(active) = matches.active {
            debug!(job_id = %active.id, %signature, "Rejecting duplicate of active job");
            return Err(Error::DuplicateJob { job_id: active.id });
        }

        if let Some(done) = matches.done {
            let job = self
                .lifecycle
                .create_done_clone(&done, NewJob::new(tool, params, signature))
                .await?;
            return Ok(Submission {
                job,
                duplicate_of: Some(done.id),
            });
        }

        let new = NewJob::new(tool, params, signature);
        let job = match &input {
            JobInput::Artifact { artifact_id, label } => {
                self.create_with_input(new, artifact_id, label.as_deref())
                    .await?
            }
            _ => self.lifecycle.create_job(new).await?,
        };

        Ok(Submission {
            job,
            duplicate_of: None,
        })
    }

    /// Create a held job, bind its input, then make it claimable.
    async fn create_with_input(
        &self,
        new: NewJob,
        artifact_id: &str,
        label: Option<&str>,
    ) -> Result<Job> {
        let job = self
            .lifecycle
            .create_job(new.held_by(SUBMITTER_HOLD))
            .await?;

        if let Err(e) = self
            .lifecycle
            .store()
            .attach(&job.id, artifact_id, ArtifactRole::Input, label)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to bind input, discarding job");
            if let Err(cleanup) = self.lifecycle.delete_job_and_artifacts(&job.id).await {
                warn!(job_id = %job.id, error = %cleanup, "Failed to discard job");
            }
            return Err(e);
        }

        self.lifecycle.release_hold(&job.id, SUBMITTER_HOLD).await?;
        self.lifecycle.get_job(&job.id).await
    }
}
