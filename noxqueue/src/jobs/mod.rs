//! Job orchestration: submission, lifecycle, execution and cancellation.

pub mod cancellation;
pub mod dedup;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod signature;
pub mod worker;

pub use cancellation::JobCancellation;
pub use dedup::{JobInput, JobSubmitter, SignatureMatches, Submission};
pub use events::{JobEvent, JobEventBus, JobEventKind, JobNotifier, JobSubscription};
pub use executor::{
    ExecutionContext, ExecutionOutcome, ExecutionResult, ExecutorRegistry, InputFile,
    JobExecutor, OutputFile,
};
pub use lifecycle::{JobLifecycle, NewJob};
pub use model::{Job, JobPage};
pub use signature::{InputFingerprint, build_signature, normalize_url};
pub use worker::{JobWorker, WorkerConfig};
