pub mod credential;
pub mod event;
pub mod job;
pub mod loaders;
pub mod task;

pub use credential::{Credential, CredentialId};
pub use event::{estimate_remaining, EventEnvelope, ProgressEvent};
pub use job::{Job, JobPlan, JobStatus, TOTAL_WEIGHT};
pub use loaders::{load_all_job_files, load_job_file, JobFile};
pub use task::{FailureKind, TaskId, TaskOutcome, TaskPayload, TaskSpec, DEFAULT_MAX_RETRIES};
