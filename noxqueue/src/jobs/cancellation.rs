//! Per-execution cancellation token.
//!
//! Two independent signals travel with every running job:
//!
//! - `cancelled`: the executor must wind down and report
//!   [`ExecutionOutcome::Cancelled`](super::executor::ExecutionOutcome::Cancelled).
//! - `stopped`: the scheduler no longer cares about the outcome. Only
//!   supervisory loops listen to it; it never terminates work.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct JobCancellation {
    job_id: Arc<str>,
    cancelled: CancellationToken,
    stopped: CancellationToken,
}

impl JobCancellation {
    pub fn new(job_id: impl Into<Arc<str>>) -> Self {
        Self {
            job_id: job_id.into(),
            cancelled: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Ask the executor to stop. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// End supervision of this execution. Idempotent.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.cancelled.cancelled().await
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Poll point for executors: `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The underlying `cancelled` token, for APIs that take a
    /// [`CancellationToken`] directly.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancelled
    }
}
