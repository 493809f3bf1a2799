use async_trait::async_trait;
use chrono::{DateTime, Utc};

use marketsync_core::JobId;

use crate::error::PipelineResult;

/// What one claim cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A job was claimed and advanced. Poll again immediately.
    Worked { job_id: JobId, succeeded: bool },
    /// Nothing eligible. Sleep before the next poll.
    Idle,
    /// A job was consumed by a condition retrying cannot fix (missing
    /// credentials, missing marketplace mapping). Sleep like `Idle` so the
    /// loop does not spin on a misconfigured account.
    Deferred { job_id: JobId },
}

impl StepOutcome {
    pub fn worked(job_id: JobId) -> Self {
        Self::Worked {
            job_id,
            succeeded: true,
        }
    }

    pub fn failed(job_id: JobId) -> Self {
        Self::Worked {
            job_id,
            succeeded: false,
        }
    }

    /// Whether the loop should poll again without sleeping.
    pub fn repoll_immediately(&self) -> bool {
        matches!(self, Self::Worked { .. })
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Worked { job_id, .. } | Self::Deferred { job_id } => Some(*job_id),
            Self::Idle => None,
        }
    }
}

/// One pipeline worker: claim at most one job and advance it by one step.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name used in logs and statistics.
    fn name(&self) -> &'static str;

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome>;
}
