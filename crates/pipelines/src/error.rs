use marketsync_core::DomainError;
use marketsync_infra::external::ActionError;
use marketsync_infra::jobs::StoreError;

/// Infrastructure failure while driving a pipeline.
///
/// Per-job business failures (adapter errors, missing credentials, bad
/// payloads) never surface here; they become job state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// The same error, as recorded on a job row.
    pub fn as_failure(&self) -> JobFailure {
        match self {
            PipelineError::Store(e) => JobFailure::Store(e.clone()),
            PipelineError::Domain(e) => JobFailure::Data(e.to_string()),
        }
    }
}

/// Why one step of a claimed job did not succeed. Recorded on the job row.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error(transparent)]
    Action(#[from] ActionError),
    /// Local precondition: credentials, marketplace mapping, upstream row.
    #[error("{0}")]
    Precondition(&'static str),
    /// The adapter reported success but its data is unusable.
    #[error("unexpected adapter data: {0}")]
    Data(String),
    /// Storage failed after the claim committed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobFailure {
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn retry_after_minutes(&self) -> Option<i64> {
        match self {
            JobFailure::Action(e) => e.retry_after_minutes(),
            _ => None,
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, JobFailure::Precondition(_))
    }
}

impl From<PipelineError> for JobFailure {
    fn from(err: PipelineError) -> Self {
        err.as_failure()
    }
}

pub type StepResult<T> = Result<T, JobFailure>;
