//! Unresolved-identifier resolution.
//!
//! A catalog line that carried only a secondary identifier (EAN, UPC, ISBN,
//! GTIN) becomes one row here. The worker asks the adapter to resolve it to an
//! ASIN. `ambiguous` and `not_found` are final answers; anything else is a soft
//! failure retried with backoff until the attempts run out.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use marketsync_core::{IdentifierStatus, MarketplaceId, UserId};
use marketsync_infra::external::{Action, ActionError, Envelope};
use marketsync_infra::jobs::{
    ClaimMark, ClaimPolicy, DuplicateRule, IdentifierDetails, JobRecord, JobScope, NewJob,
    RetryPolicy, UnresolvedIdentifier, to_chrono,
};

use crate::backoff::{Settled, release_claim, settle_failure};
use crate::context::{Access, Context};
use crate::error::{JobFailure, PipelineResult};
use crate::outcome::{StepOutcome, Worker};

/// Canonical identifier types the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierType {
    Isbn,
    Upc,
    Ean,
    Gtin,
}

impl IdentifierType {
    /// Map a report's type code (numeric or named) to a canonical type.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "2" | "isbn" => Some(Self::Isbn),
            "3" | "upc" => Some(Self::Upc),
            "4" | "ean" => Some(Self::Ean),
            "gtin" => Some(Self::Gtin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isbn => "ISBN",
            Self::Upc => "UPC",
            Self::Ean => "EAN",
            Self::Gtin => "GTIN",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct IdentifierSettings {
    pub retry: RetryPolicy,
    /// A `processing` row untouched this long belongs to a dead worker.
    pub stuck_after: Duration,
}

impl Default for IdentifierSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(5, Duration::from_secs(300), Duration::from_secs(6 * 3600)),
            stuck_after: Duration::from_secs(30 * 60),
        }
    }
}

pub fn claim_policy(settings: &IdentifierSettings, scope: JobScope) -> ClaimPolicy<IdentifierStatus> {
    ClaimPolicy::new([IdentifierStatus::Pending], |_| {
        ClaimMark::attempt(IdentifierStatus::Processing)
    })
    .max_attempts(settings.retry.max_attempts)
    .reclaim_stuck(IdentifierStatus::Processing, to_chrono(settings.stuck_after))
    .scoped(scope)
}

/// Natural key of an identifier row.
pub fn natural_key(raw_type: &str, value: &str) -> String {
    format!("{raw_type}:{value}")
}

/// Queue an identifier once per account; later sightings are ignored.
pub async fn enqueue_unresolved(
    ctx: &Context,
    user_id: UserId,
    marketplace_id: MarketplaceId,
    raw_type: &str,
    value: &str,
    now: DateTime<Utc>,
) -> PipelineResult<Option<JobRecord<UnresolvedIdentifier>>> {
    let job = NewJob::new(
        user_id,
        marketplace_id,
        natural_key(raw_type, value),
        IdentifierStatus::Pending,
        IdentifierDetails {
            raw_type: raw_type.to_string(),
            value: value.to_string(),
            asin_id: None,
        },
    );
    Ok(ctx
        .stores
        .identifiers
        .insert(job, DuplicateRule::AnyStatus, now)
        .await?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Resolved(String),
    Ambiguous,
    NotFound,
    Unresolved(String),
}

fn classify(envelope: &Envelope) -> Resolution {
    match envelope.status.as_deref() {
        Some("ambiguous") => Resolution::Ambiguous,
        Some("not_found") => Resolution::NotFound,
        Some("resolved") | None if envelope.success => match envelope.data_str("asin") {
            Some(asin) if !asin.trim().is_empty() => Resolution::Resolved(asin.trim().to_string()),
            _ => Resolution::Unresolved("resolved without an asin".to_string()),
        },
        _ => Resolution::Unresolved(envelope.error_text()),
    }
}

pub struct IdentifierWorker {
    ctx: Context,
    settings: IdentifierSettings,
    scope: JobScope,
}

impl IdentifierWorker {
    pub fn new(ctx: Context, settings: IdentifierSettings) -> Self {
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

    async fn soft_failure(
        &self,
        mut job: JobRecord<UnresolvedIdentifier>,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        let settled = settle_failure(
            &mut job,
            &self.settings.retry,
            IdentifierStatus::Pending,
            Some(IdentifierStatus::Failed),
            &failure,
            now,
        );
        self.ctx.stores.identifiers.save(&job).await?;
        match settled {
            Settled::Retrying { at } => {
                warn!(job_id = %job.id, attempts = job.attempts, retry_at = %at, error = %failure, "identifier resolution failed, will retry")
            }
            Settled::GaveUp => {
                warn!(job_id = %job.id, attempts = job.attempts, error = %failure, "identifier resolution failed permanently")
            }
        }
        Ok(StepOutcome::failed(job.id))
    }

    async fn process(
        &self,
        mut job: JobRecord<UnresolvedIdentifier>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        let Some(kind) = IdentifierType::from_raw(&job.details.raw_type) else {
            let reason = format!("unsupported identifier type {:?}", job.details.raw_type);
            job.fail(IdentifierStatus::Failed, reason.clone(), now);
            self.ctx.stores.identifiers.save(&job).await?;
            info!(job_id = %job.id, status = %job.status, reason = %reason, "identifier rejected");
            return Ok(StepOutcome::failed(job.id));
        };

        let access = match self.ctx.account_access(job.user_id, job.marketplace_id).await? {
            Access::Granted(access) => access,
            Access::Missing(reason) => {
                job.fail(IdentifierStatus::Failed, reason, now);
                self.ctx.stores.identifiers.save(&job).await?;
                warn!(job_id = %job.id, reason, "identifier skipped");
                return Ok(StepOutcome::Deferred { job_id: job.id });
            }
        };

        let request = access
            .request(Action::ResolveIdentifier, job.id)
            .arg("identifier_type", kind)
            .arg("identifier", &job.details.value);
        let envelope = match self.ctx.invoke(&request).await {
            Ok(envelope) => envelope,
            Err(e) => return self.soft_failure(job, e.into(), now).await,
        };
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;

        let status = match classify(&envelope) {
            Resolution::Resolved(asin) => {
                let record = match self
                    .ctx
                    .stores
                    .commerce
                    .ensure_asin(job.user_id, job.marketplace_id, &asin)
                    .await
                {
                    Ok(record) => record,
                    Err(e) => return self.soft_failure(job, e.into(), now).await,
                };
                job.details.asin_id = Some(record.id);
                IdentifierStatus::Resolved
            }
            Resolution::Ambiguous => IdentifierStatus::Ambiguous,
            Resolution::NotFound => IdentifierStatus::NotFound,
            Resolution::Unresolved(message) => {
                let failure = JobFailure::Action(ActionError::Rejected {
                    action: Action::ResolveIdentifier,
                    message,
                    status: envelope.status.clone(),
                    retry_after_minutes: envelope.retry_after_minutes,
                });
                return self.soft_failure(job, failure, now).await;
            }
        };

        job.complete(status, now);
        self.ctx.stores.identifiers.save(&job).await?;
        info!(job_id = %job.id, status = %job.status, asin_id = ?job.details.asin_id, "identifier settled");
        Ok(StepOutcome::worked(job.id))
    }
}

#[async_trait]
impl Worker for IdentifierWorker {
    fn name(&self) -> &'static str {
        "identifiers"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = claim_policy(&self.settings, self.scope);
        let Some(mut job) = self.ctx.stores.identifiers.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no identifier to resolve");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, attempts = job.attempts, key = %job.natural_key, "claimed identifier");
        if policy.exhausted(&job) {
            job.fail(IdentifierStatus::Failed, "worker stopped during the final attempt", now);
            self.ctx.stores.identifiers.save(&job).await?;
            warn!(job_id = %job.id, key = %job.natural_key, "identifier failed, stuck on its final attempt");
            return Ok(StepOutcome::failed(job.id));
        }

        let claimed = job.clone();
        match self.process(job, now).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let store = self.ctx.stores.identifiers.as_ref();
                release_claim(store, &claimed, IdentifierStatus::Processing, &error, now, |job, failure, now| {
                    settle_failure(
                        job,
                        &self.settings.retry,
                        IdentifierStatus::Pending,
                        Some(IdentifierStatus::Failed),
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use crate::testing::{Harness, t0};

    fn worker(h: &Harness, max_attempts: u32) -> IdentifierWorker {
        IdentifierWorker::new(
            h.ctx.clone(),
            IdentifierSettings {
                retry: RetryPolicy::fixed(max_attempts, Duration::from_secs(600)),
                ..Default::default()
            },
        )
    }

    async fn enqueue(h: &Harness, raw_type: &str, value: &str) -> JobRecord<UnresolvedIdentifier> {
        enqueue_unresolved(&h.ctx, h.user, h.marketplace, raw_type, value, t0())
            .await
            .unwrap()
            .unwrap()
    }

    async fn reload(h: &Harness, job: &JobRecord<UnresolvedIdentifier>) -> JobRecord<UnresolvedIdentifier> {
        h.ctx.stores.identifiers.get(job.id).await.unwrap().unwrap()
    }

    #[test]
    fn maps_report_codes() {
        assert_eq!(IdentifierType::from_raw("4"), Some(IdentifierType::Ean));
        assert_eq!(IdentifierType::from_raw("UPC"), Some(IdentifierType::Upc));
        assert_eq!(IdentifierType::from_raw(" gtin "), Some(IdentifierType::Gtin));
        assert_eq!(IdentifierType::from_raw("2"), Some(IdentifierType::Isbn));
        assert_eq!(IdentifierType::from_raw("1"), None);
        assert_eq!(IdentifierType::from_raw("JAN"), None);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let h = Harness::new();
        enqueue(&h, "4", "4006381333931").await;

        let again = enqueue_unresolved(&h.ctx, h.user, h.marketplace, "4", "4006381333931", t0())
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn unsupported_type_fails_without_calling_the_adapter() {
        let h = Harness::new();
        let job = enqueue(&h, "JAN", "4901234567894").await;

        let outcome = worker(&h, 5).run_once(t0()).await.unwrap();

        assert_eq!(outcome, StepOutcome::failed(job.id));
        assert_eq!(reload(&h, &job).await.status, IdentifierStatus::Failed);
        assert!(h.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn resolved_identifier_creates_the_asin() {
        let h = Harness::new();
        let job = enqueue(&h, "4", "4006381333931").await;
        h.invoker.reply(
            Action::ResolveIdentifier,
            Ok(Envelope {
                success: true,
                status: Some("resolved".into()),
                data: json!({ "asin": "B00TEST123" }),
                ..Default::default()
            }),
        );

        let outcome = worker(&h, 5).run_once(t0()).await.unwrap();
        assert_eq!(outcome, StepOutcome::worked(job.id));

        let job = reload(&h, &job).await;
        assert_eq!(job.status, IdentifierStatus::Resolved);
        assert_eq!(job.run_after, None);
        let asin = h
            .ctx
            .stores
            .commerce
            .find_asin(h.user, h.marketplace, "B00TEST123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.details.asin_id, Some(asin.id));

        let calls = h.invoker.calls_to(Action::ResolveIdentifier);
        assert_eq!(calls[0].get("identifier_type"), Some("EAN"));
        assert_eq!(calls[0].get("identifier"), Some("4006381333931"));
        assert_eq!(calls[0].get("marketplace_id"), Some("A1PA6795UKMFR9"));
        assert!(h.store.credentials_used_at(h.user, h.marketplace).unwrap().is_some());
    }

    #[tokio::test]
    async fn ambiguous_and_not_found_are_final() {
        let h = Harness::new();
        let first = enqueue(&h, "3", "012345678905").await;
        let second = enqueue(&h, "3", "036000291452").await;
        h.invoker.reply(
            Action::ResolveIdentifier,
            Ok(Envelope {
                success: true,
                status: Some("ambiguous".into()),
                ..Default::default()
            }),
        );
        h.invoker.reply(
            Action::ResolveIdentifier,
            Ok(Envelope {
                success: false,
                status: Some("not_found".into()),
                ..Default::default()
            }),
        );

        let worker = worker(&h, 5);
        worker.run_once(t0()).await.unwrap();
        worker.run_once(t0()).await.unwrap();

        assert_eq!(reload(&h, &first).await.status, IdentifierStatus::Ambiguous);
        assert_eq!(reload(&h, &second).await.status, IdentifierStatus::NotFound);
        let later = t0() + ChronoDuration::days(1);
        assert_eq!(worker.run_once(later).await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn soft_failures_retry_until_attempts_run_out() {
        let h = Harness::new();
        let job = enqueue(&h, "ean", "4006381333931").await;
        h.invoker.fail(Action::ResolveIdentifier, "quota exceeded", None);
        let worker = worker(&h, 2);

        assert_eq!(worker.run_once(t0()).await.unwrap(), StepOutcome::failed(job.id));
        let retried = reload(&h, &job).await;
        assert_eq!(retried.status, IdentifierStatus::Pending);
        assert_eq!(retried.run_after, Some(t0() + ChronoDuration::minutes(10)));
        assert_eq!(worker.run_once(t0()).await.unwrap(), StepOutcome::Idle);

        // No scripted reply: the double reports a missing envelope.
        let later = t0() + ChronoDuration::minutes(10);
        worker.run_once(later).await.unwrap();
        let failed = reload(&h, &job).await;
        assert_eq!(failed.status, IdentifierStatus::Failed);
        assert_eq!(failed.attempts, 2);
    }

    #[tokio::test]
    async fn missing_credentials_defer() {
        let h = Harness::new();
        let (user, mp) = h.account_without_credentials();
        let job = enqueue_unresolved(&h.ctx, user, mp, "4", "4006381333931", t0())
            .await
            .unwrap()
            .unwrap();

        let outcome = worker(&h, 5).run_once(t0()).await.unwrap();

        assert_eq!(outcome, StepOutcome::Deferred { job_id: job.id });
        let job = reload(&h, &job).await;
        assert_eq!(job.status, IdentifierStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("no active credentials"));
    }

    #[tokio::test]
    async fn storage_error_after_claim_returns_the_row_to_pending() {
        let h = Harness::new();
        let job = enqueue(&h, "4", "4006381333931").await;
        let settings = IdentifierSettings {
            retry: RetryPolicy::fixed(5, Duration::from_secs(600)),
            ..Default::default()
        };

        let broken = IdentifierWorker::new(h.ctx_with_unreachable_credentials(), settings);
        assert!(broken.run_once(t0()).await.is_err());
        let released = reload(&h, &job).await;
        assert_eq!(released.status, IdentifierStatus::Pending);
        assert_eq!(released.run_after, Some(t0() + ChronoDuration::minutes(10)));
        assert!(h.invoker.calls().is_empty());

        h.invoker.reply(
            Action::ResolveIdentifier,
            Ok(Envelope {
                success: true,
                status: Some("not_found".into()),
                ..Default::default()
            }),
        );
        let later = t0() + ChronoDuration::minutes(10);
        assert_eq!(worker(&h, 5).run_once(later).await.unwrap(), StepOutcome::worked(job.id));
        assert_eq!(reload(&h, &job).await.status, IdentifierStatus::NotFound);
    }

    #[tokio::test]
    async fn stuck_row_on_its_final_attempt_fails() {
        let h = Harness::new();
        let job = enqueue(&h, "4", "4006381333931").await;
        let worker = worker(&h, 1);
        let policy = claim_policy(&worker.settings, JobScope::All);
        h.ctx.stores.identifiers.claim(&policy, t0()).await.unwrap().unwrap();

        let later = t0() + ChronoDuration::hours(1);
        assert_eq!(worker.run_once(later).await.unwrap(), StepOutcome::failed(job.id));
        let failed = reload(&h, &job).await;
        assert_eq!(failed.status, IdentifierStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(h.invoker.calls().is_empty());
    }
}
