//! Executor contract and registry.
//!
//! Executors do the tool-specific work. The worker hands them the job, its
//! resolved input files and a [`JobCancellation`]; they report back with an
//! [`ExecutionOutcome`]. Executors never touch job state themselves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::cancellation::JobCancellation;
use super::model::Job;
use crate::Error;
use crate::database::models::{ArtifactDbModel, JobTool};

/// An input file bound to the job, resolved to a readable path.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub artifact: ArtifactDbModel,
    pub path: PathBuf,
    pub label: Option<String>,
}

/// Everything an executor gets besides its cancellation token.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job: Job,
    pub inputs: Vec<InputFile>,
    /// Scratch directory reserved for this job. Executors create it on demand.
    pub work_dir: PathBuf,
}

/// A file produced by an executor, to be ingested and attached as an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    /// Artifact kind, e.g. `audio`, `stem`, `video`.
    pub kind: String,
    pub name: String,
    pub format: Option<String>,
    pub label: Option<String>,
}

impl OutputFile {
    pub fn new(path: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let format = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        Self {
            path,
            kind: kind.into(),
            name,
            format,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Successful execution report.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub summary: Map<String, Value>,
    pub outputs: Vec<OutputFile>,
    /// Removed once the job is finalized, whatever the outcome.
    pub temp_paths: Vec<PathBuf>,
}

/// How an execution ended.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    Failed(String),
    Cancelled,
}

impl ExecutionOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<crate::Result<ExecutionResult>> for ExecutionOutcome {
    fn from(result: crate::Result<ExecutionResult>) -> Self {
        match result {
            Ok(result) => Self::Completed(result),
            Err(Error::Cancelled) => Self::Cancelled,
            Err(Error::Execution(message)) => Self::Failed(message),
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the job. Implementations poll `token` at least once a second and
    /// return [`ExecutionOutcome::Cancelled`] once it fires.
    async fn execute(&self, ctx: &ExecutionContext, token: &JobCancellation) -> ExecutionOutcome;
}

/// Tool to executor mapping.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<JobTool, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `tool`, replacing any previous registration.
    pub fn register(&mut self, tool: JobTool, executor: Arc<dyn JobExecutor>) -> &mut Self {
        self.executors.insert(tool, executor);
        self
    }

    pub fn with(mut self, tool: JobTool, executor: Arc<dyn JobExecutor>) -> Self {
        self.register(tool, executor);
        self
    }

    pub fn get(&self, tool: JobTool) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&tool).cloned()
    }

    pub fn tools(&self) -> Vec<JobTool> {
        let mut tools: Vec<JobTool> = self.executors.keys().copied().collect();
        tools.sort_by_key(|t| t.as_str());
        tools
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("tools", &self.tools())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobExecutor for Noop {
        async fn execute(&self, _ctx: &ExecutionContext, _token: &JobCancellation) -> ExecutionOutcome {
            ExecutionOutcome::Completed(ExecutionResult::default())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ExecutorRegistry::new().with(JobTool::Analyze, Arc::new(Noop));
        assert!(registry.get(JobTool::Analyze).is_some());
        assert!(registry.get(JobTool::Transcode).is_none());
        assert_eq!(registry.tools(), vec![JobTool::Analyze]);
    }

    #[test]
    fn test_outcome_from_result() {
        assert!(matches!(
            ExecutionOutcome::from(Err(Error::Cancelled)),
            ExecutionOutcome::Cancelled
        ));
        match ExecutionOutcome::from(Err(Error::execution("exit code 1"))) {
            ExecutionOutcome::Failed(msg) => assert_eq!(msg, "exit code 1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            ExecutionOutcome::from(Ok(ExecutionResult::default())),
            ExecutionOutcome::Completed(_)
        ));
    }

    #[test]
    fn test_output_file_defaults() {
        let out = OutputFile::new("/tmp/work/Vocals.WAV", "stem").with_label("vocals");
        assert_eq!(out.name, "Vocals.WAV");
        assert_eq!(out.format.as_deref(), Some("wav"));
        assert_eq!(out.label.as_deref(), Some("vocals"));
    }
}
