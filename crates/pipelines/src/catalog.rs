//! Multi-step catalog report sync.
//!
//! ```text
//! pending -> worker_started -> worker_fetching -> worker_fetched -> completed
//!                 ^                  |                  |
//!                 +---- error <------+------------------+
//! ```
//!
//! Each claim advances the job by exactly one step. Intermediate results (the
//! report id, the downloaded file) live in the activity log, which also feeds
//! the claim cooldown. A job is leased for the duration of its adapter call so
//! a second worker cannot pick it up while the call is still in flight.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use marketsync_core::{CatalogSyncStatus, JobState, MarketplaceId, UserId};
use marketsync_infra::activity::ActivityStream;
use marketsync_infra::external::Action;
use marketsync_infra::jobs::{
    CatalogSync, CatalogSyncDetails, ClaimMark, ClaimPolicy, DuplicateRule, JobRecord, JobScope,
    NewJob, to_chrono,
};

use crate::context::Context;
use crate::error::{JobFailure, PipelineResult, StepResult};
use crate::identifiers::enqueue_unresolved;
use crate::outcome::{StepOutcome, Worker};
use crate::start_policy::{StartDecision, StartPolicy};

const STREAM: ActivityStream = ActivityStream::CatalogSync;

/// Activity step codes.
pub mod steps {
    pub const STARTED: &str = "worker_started";
    pub const RETRY: &str = "retry";
    pub const REPORT_REQUESTED: &str = "report_requested";
    pub const REPORT_DOWNLOADED: &str = "report_downloaded";
    pub const REPORT_IMPORTED: &str = "report_imported";
    pub const ERROR: &str = "error";
}

/// Statuses that make an account's catalog sync "already running".
pub const ACTIVE: &[CatalogSyncStatus] = &[
    CatalogSyncStatus::Pending,
    CatalogSyncStatus::WorkerStarted,
    CatalogSyncStatus::WorkerFetching,
    CatalogSyncStatus::WorkerFetched,
];

#[derive(Debug, Clone)]
pub struct CatalogSyncSettings {
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub start: StartPolicy,
}

impl Default for CatalogSyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cooldown: Duration::from_secs(60),
            start: StartPolicy::default(),
        }
    }
}

fn claim_mark(status: CatalogSyncStatus) -> ClaimMark<CatalogSyncStatus> {
    match status {
        CatalogSyncStatus::Pending | CatalogSyncStatus::Error => ClaimMark::attempt(status),
        other => ClaimMark::resume(other),
    }
}

/// Starting or retrying consumes an attempt; continuing a workflow does not.
pub fn claim_policy(settings: &CatalogSyncSettings, scope: JobScope) -> ClaimPolicy<CatalogSyncStatus> {
    ClaimPolicy::new(
        [
            CatalogSyncStatus::Pending,
            CatalogSyncStatus::WorkerStarted,
            CatalogSyncStatus::WorkerFetching,
            CatalogSyncStatus::WorkerFetched,
            CatalogSyncStatus::Error,
        ],
        claim_mark,
    )
    .max_attempts(settings.max_attempts)
    .cooldown(to_chrono(settings.cooldown))
    .scoped(scope)
}

/// Result of a start request.
#[derive(Debug, Clone)]
pub enum CatalogStart {
    Queued(JobRecord<CatalogSync>),
    Refused(StartDecision),
}

/// Queue a catalog sync for the account unless the start policy refuses.
pub async fn dispatch(
    ctx: &Context,
    settings: &CatalogSyncSettings,
    user_id: UserId,
    marketplace_id: MarketplaceId,
    report_type: Option<&str>,
    now: DateTime<Utc>,
) -> PipelineResult<CatalogStart> {
    let scope = JobScope::account(user_id, marketplace_id);
    let decision = settings
        .start
        .check(ctx.stores.catalog.as_ref(), scope, ACTIVE, now)
        .await?;
    if !decision.is_allowed() {
        debug!(user_id = %user_id, marketplace_id = %marketplace_id, ?decision, "catalog sync not started");
        return Ok(CatalogStart::Refused(decision));
    }

    let details = match report_type {
        Some(report_type) => CatalogSyncDetails {
            report_type: report_type.to_string(),
        },
        None => CatalogSyncDetails::default(),
    };
    let job = NewJob::new(user_id, marketplace_id, "catalog", CatalogSyncStatus::Pending, details);
    let rule = DuplicateRule::AmongStatuses(ACTIVE.to_vec());
    match ctx.stores.catalog.insert(job, rule, now).await? {
        Some(job) => {
            info!(job_id = %job.id, user_id = %user_id, marketplace_id = %marketplace_id, "catalog sync queued");
            Ok(CatalogStart::Queued(job))
        }
        // Lost a race with a concurrent start.
        None => {
            let decision = settings
                .start
                .check(ctx.stores.catalog.as_ref(), scope, ACTIVE, now)
                .await?;
            Ok(CatalogStart::Refused(decision))
        }
    }
}

/// One entry of `data.unresolved` in the import envelope.
#[derive(Debug, Deserialize)]
struct UnresolvedLine {
    identifier_type: String,
    identifier: String,
}

pub struct CatalogSyncWorker {
    ctx: Context,
    settings: CatalogSyncSettings,
    scope: JobScope,
}

impl CatalogSyncWorker {
    pub fn new(ctx: Context, settings: CatalogSyncSettings) -> Self {
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

    async fn log(
        &self,
        job: &JobRecord<CatalogSync>,
        step: &str,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> StepResult<()> {
        self.ctx
            .stores
            .activity
            .append(STREAM, job.id, step, payload, now)
            .await?;
        Ok(())
    }

    /// Keep other workers off the row while `action` runs.
    async fn lease(
        &self,
        job: &mut JobRecord<CatalogSync>,
        action: Action,
        now: DateTime<Utc>,
    ) -> StepResult<()> {
        job.run_after = Some(now + to_chrono(self.ctx.timeouts.for_action(action)));
        job.updated_at = now;
        self.ctx.stores.catalog.save(job).await?;
        Ok(())
    }

    async fn advance_to(
        &self,
        job: &mut JobRecord<CatalogSync>,
        status: CatalogSyncStatus,
        now: DateTime<Utc>,
    ) -> StepResult<()> {
        let from = job.status;
        job.run_after = None;
        if status == CatalogSyncStatus::Completed {
            job.complete(status, now);
        } else {
            job.transition(status, now);
        }
        self.ctx.stores.catalog.save(job).await?;
        info!(job_id = %job.id, from = %from, to = %job.status, attempts = job.attempts, "catalog sync advanced");
        Ok(())
    }

    async fn step(&self, job: &mut JobRecord<CatalogSync>, now: DateTime<Utc>) -> StepResult<()> {
        match job.status {
            CatalogSyncStatus::Pending => {
                self.log(job, steps::STARTED, JsonValue::Null, now).await?;
                self.advance_to(job, CatalogSyncStatus::WorkerStarted, now).await
            }
            CatalogSyncStatus::Error => {
                self.log(job, steps::RETRY, json!({ "attempt": job.attempts }), now)
                    .await?;
                self.advance_to(job, CatalogSyncStatus::WorkerStarted, now).await
            }
            CatalogSyncStatus::WorkerStarted => self.request_report(job, now).await,
            CatalogSyncStatus::WorkerFetching => self.poll_report(job, now).await,
            CatalogSyncStatus::WorkerFetched => self.import_report(job, now).await,
            CatalogSyncStatus::Completed => Ok(()),
        }
    }

    async fn request_report(&self, job: &mut JobRecord<CatalogSync>, now: DateTime<Utc>) -> StepResult<()> {
        let access = self.ctx.require_access(job.user_id, job.marketplace_id).await?;
        self.lease(job, Action::RequestReport, now).await?;

        let request = access
            .request(Action::RequestReport, job.id)
            .arg("report_type", &job.details.report_type);
        let envelope = self.ctx.run(&request).await?;
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;

        let report_id = envelope
            .data_str("report_id")
            .ok_or_else(|| JobFailure::data("request_report returned no report_id"))?;
        self.log(job, steps::REPORT_REQUESTED, json!({ "report_id": report_id }), now)
            .await?;
        self.advance_to(job, CatalogSyncStatus::WorkerFetching, now).await
    }

    async fn poll_report(&self, job: &mut JobRecord<CatalogSync>, now: DateTime<Utc>) -> StepResult<()> {
        let report_id = self.logged_value(job, steps::REPORT_REQUESTED, "report_id").await?;
        let access = self.ctx.require_access(job.user_id, job.marketplace_id).await?;
        self.lease(job, Action::PollReport, now).await?;

        let request = access
            .request(Action::PollReport, job.id)
            .arg("report_id", &report_id);
        let envelope = self.ctx.run(&request).await?;
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;

        let file = envelope
            .data_str("file")
            .ok_or_else(|| JobFailure::data("poll_report returned no file"))?;
        self.log(
            job,
            steps::REPORT_DOWNLOADED,
            json!({ "report_id": report_id, "file": file }),
            now,
        )
        .await?;
        self.advance_to(job, CatalogSyncStatus::WorkerFetched, now).await
    }

    async fn import_report(&self, job: &mut JobRecord<CatalogSync>, now: DateTime<Utc>) -> StepResult<()> {
        let file = self.logged_value(job, steps::REPORT_DOWNLOADED, "file").await?;
        let access = self.ctx.require_access(job.user_id, job.marketplace_id).await?;
        self.lease(job, Action::ImportReport, now).await?;

        let request = access.request(Action::ImportReport, job.id).arg("file", &file);
        let envelope = self.ctx.run(&request).await?;
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;

        let unresolved: Vec<UnresolvedLine> = match envelope.data.get("unresolved") {
            Some(lines) => serde_json::from_value(lines.clone())
                .map_err(|e| JobFailure::data(format!("import_report unresolved list: {e}")))?,
            None => Vec::new(),
        };
        let mut queued = 0usize;
        for line in &unresolved {
            if enqueue_unresolved(
                &self.ctx,
                job.user_id,
                job.marketplace_id,
                &line.identifier_type,
                &line.identifier,
                now,
            )
            .await?
            .is_some()
            {
                queued += 1;
            }
        }

        let imported = envelope.data.get("imported").cloned().unwrap_or(JsonValue::Null);
        self.log(
            job,
            steps::REPORT_IMPORTED,
            json!({ "file": file, "imported": imported, "unresolved": queued }),
            now,
        )
        .await?;
        self.advance_to(job, CatalogSyncStatus::Completed, now).await
    }

    /// String field of the newest activity entry with `step`.
    async fn logged_value(
        &self,
        job: &JobRecord<CatalogSync>,
        step: &'static str,
        field: &str,
    ) -> StepResult<String> {
        let entry = self
            .ctx
            .stores
            .activity
            .latest_step(STREAM, job.id, step)
            .await?;
        entry
            .as_ref()
            .and_then(|e| e.payload.get(field))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or(JobFailure::Precondition(match step {
                steps::REPORT_REQUESTED => "no report id logged",
                _ => "no downloaded file logged",
            }))
    }

    async fn record_failure(
        &self,
        mut job: JobRecord<CatalogSync>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let from = job.status;
        job.fail(CatalogSyncStatus::Error, failure.to_string(), now);
        job.run_after = None;
        self.ctx.stores.catalog.save(&job).await?;
        self.ctx
            .stores
            .activity
            .append(
                STREAM,
                job.id,
                steps::ERROR,
                json!({ "from": from.as_str(), "error": failure.to_string() }),
                now,
            )
            .await?;

        if job.attempts >= self.settings.max_attempts {
            warn!(job_id = %job.id, from = %from, attempts = job.attempts, error = %failure, "catalog sync failed, attempts exhausted");
        } else {
            warn!(job_id = %job.id, from = %from, attempts = job.attempts, error = %failure, "catalog sync failed, will retry");
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for CatalogSyncWorker {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = claim_policy(&self.settings, self.scope);
        let Some(mut job) = self.ctx.stores.catalog.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no catalog sync due");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, status = %job.status, attempts = job.attempts, "claimed catalog sync");

        match self.step(&mut job, now).await {
            Ok(()) => Ok(StepOutcome::worked(job.id)),
            Err(failure) => {
                let job_id = job.id;
                self.record_failure(job, &failure, now).await?;
                Ok(StepOutcome::failed(job_id))
            }
        }
    }
}
