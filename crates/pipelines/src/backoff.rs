//! Soft-failure bookkeeping shared by the retrying pipelines.

use chrono::{DateTime, Utc};
use tracing::warn;

use marketsync_infra::jobs::{JobRecord, JobStore, Pipeline, RetryPolicy};

use crate::error::{JobFailure, PipelineError};

/// Where a soft failure left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    Retrying { at: DateTime<Utc> },
    GaveUp,
}

/// Schedule a retry in `retry` status, or move to `give_up` once the policy's
/// attempts are spent. Without a `give_up` status the claim predicate's cap is
/// the only bound.
///
/// The adapter's `retry_after_minutes`, when positive, replaces the backoff delay.
pub(crate) fn settle_failure<P: Pipeline>(
    job: &mut JobRecord<P>,
    policy: &RetryPolicy,
    retry: P::Status,
    give_up: Option<P::Status>,
    failure: &JobFailure,
    now: DateTime<Utc>,
) -> Settled {
    let message = failure.to_string();
    match give_up {
        Some(terminal) if !policy.should_retry(job.attempts) => {
            job.fail(terminal, message, now);
            Settled::GaveUp
        }
        _ => {
            let at = policy.next_run_after(job.attempts, failure.retry_after_minutes(), now);
            job.retry_at(retry, message, at, now);
            Settled::Retrying { at }
        }
    }
}

/// Best-effort release of a claimed row after `error` aborted its run.
///
/// The row is re-read; if it is still the claim's `in_flight` state, `settle`
/// records the error on it and the result is saved, so a later worker can
/// claim it again. Nothing here fails: the caller returns `error` regardless.
pub(crate) async fn release_claim<P, F>(
    store: &dyn JobStore<P>,
    claimed: &JobRecord<P>,
    in_flight: P::Status,
    error: &PipelineError,
    now: DateTime<Utc>,
    settle: F,
) where
    P: Pipeline,
    F: FnOnce(&mut JobRecord<P>, &JobFailure, DateTime<Utc>),
{
    let mut job = match store.get(claimed.id).await {
        Ok(Some(job)) if job.status == in_flight && job.attempts == claimed.attempts => job,
        Ok(_) => return,
        Err(e) => {
            warn!(job_id = %claimed.id, error = %e, cause = %error, "claimed job could not be re-read, left in flight");
            return;
        }
    };
    let failure = error.as_failure();
    settle(&mut job, &failure, now);
    match store.save(&job).await {
        Ok(()) => {
            warn!(job_id = %job.id, status = %job.status, error = %error, "claimed job released after an infrastructure error")
        }
        Err(e) => {
            warn!(job_id = %job.id, error = %e, cause = %error, "claimed job could not be released, left in flight")
        }
    }
}
