//! Executor that runs a configured shell command.
//!
//! The template may reference:
//!
//! - `{input}`: path of the first input file
//! - `{inputs}`: every input path, space separated
//! - `{output_dir}`: the job's scratch directory (also the working directory)
//! - `{param:<key>}`: a job parameter; strings verbatim, other values as JSON
//!
//! Every substituted value is shell-quoted. After a zero exit, each regular
//! file under the scratch directory becomes an output and the directory
//! itself is reported for cleanup.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use process_utils::{DEFAULT_TERMINATE_GRACE, WaitOutcome, tokio_command, wait_or_terminate};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::database::models::JobTool;
use crate::jobs::lifecycle::remove_temp_paths;
use crate::jobs::{
    ExecutionContext, ExecutionOutcome, ExecutionResult, JobCancellation, JobExecutor, OutputFile,
};
use crate::{Error, Result};

/// Stderr lines kept for the error message of a failed command.
const STDERR_TAIL_LINES: usize = 20;

/// How long to keep reading output after the command itself has exited.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct CommandExecutor {
    template: String,
    output_kind: String,
    grace: Duration,
}

impl CommandExecutor {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            output_kind: "file".to_string(),
            grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    /// Executor for `tool` with the conventional output kind of that tool.
    pub fn for_tool(tool: JobTool, template: impl Into<String>) -> Self {
        let kind = match tool {
            JobTool::Transcode => "audio",
            JobTool::Separate => "stem",
            JobTool::Download => "media",
            JobTool::Analyze => "analysis",
        };
        Self::new(template).with_output_kind(kind)
    }

    /// Artifact kind recorded for outputs.
    pub fn with_output_kind(mut self, kind: impl Into<String>) -> Self {
        self.output_kind = kind.into();
        self
    }

    /// Window between the termination signal and a forced kill.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn render(&self, ctx: &ExecutionContext) -> Result<String> {
        let mut rendered = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                rendered.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let placeholder = &after[..end];
            match placeholder {
                "input" => {
                    let first = ctx.inputs.first().ok_or_else(|| {
                        Error::validation("Command references {input} but the job has no inputs")
                    })?;
                    rendered.push_str(&shell_quote(&first.path.to_string_lossy()));
                }
                "inputs" => {
                    let joined: Vec<String> = ctx
                        .inputs
                        .iter()
                        .map(|i| shell_quote(&i.path.to_string_lossy()))
                        .collect();
                    rendered.push_str(&joined.join(" "));
                }
                "output_dir" => {
                    rendered.push_str(&shell_quote(&ctx.work_dir.to_string_lossy()));
                }
                other => match other.strip_prefix("param:") {
                    Some(key) => {
                        let value = param_value(&ctx.job.params, key)?;
                        rendered.push_str(&shell_quote(&value));
                    }
                    // Not ours; keep it literally (e.g. shell `${VAR}`).
                    None => rendered.push_str(&rest[start..start + end + 2]),
                },
            }
            rest = &after[end + 1..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }

    async fn run(&self, ctx: &ExecutionContext, token: &JobCancellation) -> Result<ExecutionResult> {
        token.check()?;
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let command = self.render(ctx)?;
        let job_id = ctx.job.id.as_str();
        info!(job_id, %command, "Running command");

        let started = Instant::now();
        let mut cmd = shell_command(&command);
        cmd.current_dir(&ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::execution(format!("Failed to spawn command: {e}")))?;

        let stdout_task = child.stdout.take().map(|stdout| {
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id = %job_id, "stdout: {}", line);
                }
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id = %job_id, "stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail
            })
        });

        let outcome = wait_or_terminate(&mut child, token.cancel_token(), self.grace)
            .await
            .map_err(|e| Error::execution(format!("Failed to wait for command: {e}")))?;

        let status = match outcome {
            WaitOutcome::Cancelled { forced } => {
                // Grandchildren may still hold the pipes open.
                if let Some(task) = &stdout_task {
                    task.abort();
                }
                if let Some(task) = &stderr_task {
                    task.abort();
                }
                info!(job_id, forced, "Command terminated after cancellation");
                return Err(Error::Cancelled);
            }
            WaitOutcome::Exited(status) => status,
        };

        if let Some(task) = stdout_task {
            drain_reader(job_id, task).await;
        }
        let stderr_tail = match stderr_task {
            Some(task) => drain_reader(job_id, task).await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = stderr_tail.into_iter().collect::<Vec<_>>().join("\n");
            return Err(Error::execution(if detail.is_empty() {
                format!("Command exited with code {code}")
            } else {
                format!("Command exited with code {code}: {detail}")
            }));
        }

        let outputs: Vec<OutputFile> = collect_files(&ctx.work_dir)
            .await?
            .into_iter()
            .map(|path| OutputFile::new(path, self.output_kind.clone()))
            .collect();

        let mut summary = Map::new();
        summary.insert("exit_code".to_string(), Value::from(status.code().unwrap_or(0)));
        summary.insert(
            "duration_secs".to_string(),
            Value::from(started.elapsed().as_secs_f64()),
        );
        summary.insert("output_count".to_string(), Value::from(outputs.len()));

        info!(job_id, outputs = outputs.len(), "Command completed");
        Ok(ExecutionResult {
            summary,
            outputs,
            temp_paths: vec![ctx.work_dir.clone()],
        })
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, ctx: &ExecutionContext, token: &JobCancellation) -> ExecutionOutcome {
        let result = self.run(ctx, token).await;
        if result.is_err() {
            remove_temp_paths(std::slice::from_ref(&ctx.work_dir)).await;
        }
        if let Err(e) = &result
            && !e.is_cancelled()
        {
            warn!(job_id = %ctx.job.id, error = %e, "Command failed");
        }
        ExecutionOutcome::from(result)
    }
}

/// Wait briefly for a pipe reader; a reader still blocked on a pipe held by a
/// background process is aborted.
async fn drain_reader<T>(job_id: &str, mut task: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            debug!(job_id, error = %e, "Output reader ended abnormally");
            None
        }
        Err(_) => {
            debug!(job_id, "Output still open after exit, no longer reading");
            task.abort();
            None
        }
    }
}

fn param_value(params: &Map<String, Value>, key: &str) -> Result<String> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(Error::validation(format!(
            "Command references {{param:{key}}} but the job has no such parameter"
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

#[cfg(not(windows))]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(windows)]
fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio_command("sh");
    cmd.args(["-c", command]);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio_command("cmd");
    cmd.args(["/C", command]);
    cmd
}

/// Regular files under `dir`, sorted by path.
async fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
