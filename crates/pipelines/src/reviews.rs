//! Scheduled review solicitations.
//!
//! Each shipped (order, ASIN) pair with enabled settings gets one row that
//! becomes due `delay_days` after purchase, at the configured hour (UTC). A
//! worker that dies mid-request leaves its row in `processing`; such rows are
//! claimable again once they have been untouched for `stuck_after`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tracing::{debug, info, warn};

use marketsync_core::ReviewRequestStatus;
use marketsync_infra::external::Action;
use marketsync_infra::jobs::{
    ClaimMark, ClaimOrder, ClaimPolicy, DuplicateRule, JobRecord, JobScope, NewJob, RetryPolicy,
    ReviewRequest, ReviewRequestDetails, to_chrono,
};

use crate::backoff::{Settled, release_claim, settle_failure};
use crate::context::Context;
use crate::error::{JobFailure, PipelineResult};
use crate::outcome::{StepOutcome, Worker};

#[derive(Debug, Clone)]
pub struct ReviewRequestSettings {
    pub stuck_after: Duration,
    pub retry: RetryPolicy,
    pub dispatch_batch: usize,
}

impl Default for ReviewRequestSettings {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(30 * 60),
            retry: RetryPolicy::exponential(5, Duration::from_secs(900), Duration::from_secs(12 * 3600)),
            dispatch_batch: 200,
        }
    }
}

/// `purchase_date + delay_days`, pinned to `processing_hour` o'clock UTC.
pub fn review_run_after(
    purchase_date: DateTime<Utc>,
    delay_days: u32,
    processing_hour: u32,
) -> DateTime<Utc> {
    let day = (purchase_date + chrono::Duration::days(i64::from(delay_days))).date_naive();
    let at = NaiveTime::from_hms_opt(processing_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    day.and_time(at).and_utc()
}

pub fn natural_key(order_id: &str, asin: &str) -> String {
    format!("{order_id}:{asin}")
}

pub fn claim_policy(settings: &ReviewRequestSettings, scope: JobScope) -> ClaimPolicy<ReviewRequestStatus> {
    ClaimPolicy::new(
        [ReviewRequestStatus::Pending, ReviewRequestStatus::Failed],
        |_| ClaimMark::attempt(ReviewRequestStatus::Processing),
    )
    .ordered_by(ClaimOrder::RunAfter)
    .max_attempts(settings.retry.max_attempts)
    .reclaim_stuck(ReviewRequestStatus::Processing, to_chrono(settings.stuck_after))
    .scoped(scope)
}

/// Queue every review candidate not queued yet.
pub async fn dispatch(
    ctx: &Context,
    settings: &ReviewRequestSettings,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    let candidates = ctx
        .stores
        .commerce
        .review_candidates(settings.dispatch_batch)
        .await?;

    let mut created = 0;
    for candidate in candidates {
        let run_after = review_run_after(
            candidate.purchase_date,
            candidate.delay_days,
            candidate.processing_hour,
        );
        let job = NewJob::<ReviewRequest>::new(
            candidate.user_id,
            candidate.marketplace_id,
            natural_key(&candidate.order_id, &candidate.asin),
            ReviewRequestStatus::Pending,
            ReviewRequestDetails {
                order_id: candidate.order_id,
                asin: candidate.asin,
                requested_at: None,
            },
        )
        .run_after(run_after);
        if ctx
            .stores
            .reviews
            .insert(job, DuplicateRule::AnyStatus, now)
            .await?
            .is_some()
        {
            created += 1;
        }
    }
    debug!(created, "review request dispatch pass");
    Ok(created)
}

pub struct ReviewRequestWorker {
    ctx: Context,
    settings: ReviewRequestSettings,
    scope: JobScope,
}

impl ReviewRequestWorker {
    pub fn new(ctx: Context, settings: ReviewRequestSettings) -> Self {
        Self {
            ctx,
            settings,
            scope: JobScope::All,
        }
    }

    pub fn scoped(mut self, scope: JobScope) -> Self {
        self.scope = scope;
        self
    }

    async fn request(&self, job: &JobRecord<ReviewRequest>, now: DateTime<Utc>) -> Result<(), JobFailure> {
        let access = self.ctx.require_access(job.user_id, job.marketplace_id).await?;
        let request = access
            .request(Action::RequestReview, job.id)
            .arg("order_id", &job.details.order_id)
            .arg("asin", &job.details.asin);
        self.ctx.run(&request).await?;
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;
        Ok(())
    }

    async fn process(
        &self,
        mut job: JobRecord<ReviewRequest>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        match self.request(&job, now).await {
            Ok(()) => {
                job.details.requested_at = Some(now);
                job.complete(ReviewRequestStatus::Completed, now);
                self.ctx.stores.reviews.save(&job).await?;
                info!(job_id = %job.id, order_id = %job.details.order_id, asin = %job.details.asin, "review requested");
                Ok(StepOutcome::worked(job.id))
            }
            Err(failure) => {
                let settled = settle_failure(
                    &mut job,
                    &self.settings.retry,
                    ReviewRequestStatus::Failed,
                    None,
                    &failure,
                    now,
                );
                self.ctx.stores.reviews.save(&job).await?;
                if let Settled::Retrying { at } = settled {
                    warn!(job_id = %job.id, attempts = job.attempts, retry_at = %at, error = %failure, "review request failed");
                }
                if failure.is_precondition() {
                    Ok(StepOutcome::Deferred { job_id: job.id })
                } else {
                    Ok(StepOutcome::failed(job.id))
                }
            }
        }
    }
}

#[async_trait]
impl Worker for ReviewRequestWorker {
    fn name(&self) -> &'static str {
        "reviews"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = claim_policy(&self.settings, self.scope);
        let Some(mut job) = self.ctx.stores.reviews.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no review request due");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, key = %job.natural_key, attempts = job.attempts, "claimed review request");
        if policy.exhausted(&job) {
            job.fail(ReviewRequestStatus::Failed, "worker stopped during the final attempt", now);
            self.ctx.stores.reviews.save(&job).await?;
            warn!(job_id = %job.id, key = %job.natural_key, "review request failed, stuck on its final attempt");
            return Ok(StepOutcome::failed(job.id));
        }

        let claimed = job.clone();
        match self.process(job, now).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let store = self.ctx.stores.reviews.as_ref();
                release_claim(store, &claimed, ReviewRequestStatus::Processing, &error, now, |job, failure, now| {
                    settle_failure(
                        job,
                        &self.settings.retry,
                        ReviewRequestStatus::Failed,
                        None,
                        failure,
                        now,
                    );
                })
                .await;
                Err(error)
            }
        }
    }
}
