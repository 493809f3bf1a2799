//! Windowed order sync.
//!
//! One job per account fetches orders created inside `[from, to]`. The window
//! starts a few days before the previous successful run finished, so late
//! updates and clock skew are absorbed by re-fetching the overlap. Rows are
//! upserted by (user, marketplace, order id).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use marketsync_core::{MarketplaceId, OrderSyncStatus, UserId};
use marketsync_infra::activity::ActivityStream;
use marketsync_infra::commerce::OrderRecord;
use marketsync_infra::external::Action;
use marketsync_infra::jobs::{
    ClaimMark, ClaimOrder, ClaimPolicy, DuplicateRule, JobRecord, JobScope, NewJob, OrderSync,
    OrderSyncDetails, RetryPolicy, to_chrono,
};

use crate::backoff::{Settled, release_claim, settle_failure};
use crate::context::{Access, AccountAccess, Context};
use crate::error::{JobFailure, PipelineResult, StepResult};
use crate::outcome::{StepOutcome, Worker};

const STREAM: ActivityStream = ActivityStream::OrderSync;
const NATURAL_KEY: &str = "orders";

/// Statuses that block a second dispatch for the same account.
pub const OPEN: &[OrderSyncStatus] = &[
    OrderSyncStatus::Pending,
    OrderSyncStatus::Running,
    OrderSyncStatus::Fail,
];

#[derive(Debug, Clone)]
pub struct OrderSyncSettings {
    /// Window length when there is no previous successful run, or when forced.
    pub fallback_days: i64,
    /// Re-fetched days before the previous successful run finished.
    pub overlap_days: i64,
    pub retry: RetryPolicy,
    /// A `running` row untouched this long belongs to a dead worker.
    pub stuck_after: Duration,
}

impl Default for OrderSyncSettings {
    fn default() -> Self {
        Self {
            fallback_days: 14,
            overlap_days: 3,
            retry: RetryPolicy::exponential(5, Duration::from_secs(300), Duration::from_secs(6 * 3600)),
            stuck_after: Duration::from_secs(2 * 3600),
        }
    }
}

/// `[from, to]` of the next fetch.
pub fn order_window(
    last_finished: Option<DateTime<Utc>>,
    forced: bool,
    settings: &OrderSyncSettings,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = match last_finished {
        Some(finished) if !forced => finished - chrono::Duration::days(settings.overlap_days),
        _ => now - chrono::Duration::days(settings.fallback_days),
    };
    (from, now)
}

pub fn claim_policy(settings: &OrderSyncSettings, scope: JobScope) -> ClaimPolicy<OrderSyncStatus> {
    ClaimPolicy::new([OrderSyncStatus::Pending, OrderSyncStatus::Fail], |_| {
        ClaimMark::attempt(OrderSyncStatus::Running)
    })
    .ordered_by(ClaimOrder::RunAfter)
    .max_attempts(settings.retry.max_attempts)
    .reclaim_stuck(OrderSyncStatus::Running, to_chrono(settings.stuck_after))
    .scoped(scope)
}

/// Queue an order sync for the account. `None` when one is already open.
pub async fn dispatch(
    ctx: &Context,
    settings: &OrderSyncSettings,
    user_id: UserId,
    marketplace_id: MarketplaceId,
    forced: bool,
    now: DateTime<Utc>,
) -> PipelineResult<Option<JobRecord<OrderSync>>> {
    let scope = JobScope::account(user_id, marketplace_id);
    let last_finished = ctx
        .stores
        .orders
        .latest(scope, &[OrderSyncStatus::Completed])
        .await?
        .and_then(|job| job.finished_at);
    let (from, to) = order_window(last_finished, forced, settings, now);

    let job = NewJob::new(
        user_id,
        marketplace_id,
        NATURAL_KEY,
        OrderSyncStatus::Pending,
        OrderSyncDetails {
            from,
            to,
            forced,
            imported: None,
        },
    );
    let Some(job) = ctx
        .stores
        .orders
        .insert(job, DuplicateRule::AmongStatuses(OPEN.to_vec()), now)
        .await?
    else {
        debug!(user_id = %user_id, marketplace_id = %marketplace_id, "order sync already open");
        return Ok(None);
    };

    ctx.stores
        .activity
        .append(STREAM, job.id, "queued", json!({ "from": from, "to": to, "forced": forced }), now)
        .await?;
    info!(job_id = %job.id, user_id = %user_id, marketplace_id = %marketplace_id, from = %from, to = %to, "order sync queued");
    Ok(Some(job))
}

/// Fields of a fetched order the store keys and filters on. The full object is
/// kept as the payload.
#[derive(Debug, Deserialize)]
struct FetchedOrder {
    order_id: String,
    order_status: String,
    purchase_date: DateTime<Utc>,
    #[serde(default)]
    last_update_date: Option<DateTime<Utc>>,
}

fn parse_orders(
    data: &JsonValue,
    job: &JobRecord<OrderSync>,
) -> StepResult<Vec<OrderRecord>> {
    let Some(entries) = data.get("orders").and_then(JsonValue::as_array) else {
        return Err(JobFailure::data("fetch_orders returned no orders list"));
    };
    entries
        .iter()
        .map(|entry| {
            let order: FetchedOrder = serde_json::from_value(entry.clone())
                .map_err(|e| JobFailure::data(format!("order entry: {e}")))?;
            Ok(OrderRecord {
                user_id: job.user_id,
                marketplace_id: job.marketplace_id,
                order_id: order.order_id,
                order_status: order.order_status,
                purchase_date: order.purchase_date,
                last_update_date: order.last_update_date,
                items_imported: false,
                payload: entry.clone(),
            })
        })
        .collect()
}

pub struct OrderSyncWorker {
    ctx: Context,
    settings: OrderSyncSettings,
    scope: JobScope,
}

impl OrderSyncWorker {
    pub fn new(ctx: Context, settings: OrderSyncSettings) -> Self {
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

    async fn fetch(
        &self,
        job: &JobRecord<OrderSync>,
        access: &AccountAccess,
        now: DateTime<Utc>,
    ) -> StepResult<u64> {
        let request = access
            .request(Action::FetchOrders, job.id)
            .arg(
                "created_after",
                job.details.from.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .arg(
                "created_before",
                job.details.to.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        let envelope = self.ctx.run(&request).await?;
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;

        let orders = parse_orders(&envelope.data, job)?;
        Ok(self.ctx.stores.commerce.upsert_orders(&orders, now).await?)
    }

    /// A reclaimed row whose final attempt died with its worker.
    async fn abandon(
        &self,
        mut job: JobRecord<OrderSync>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        let reason = "worker stopped during the final attempt";
        job.fail(OrderSyncStatus::Skipped, reason, now);
        self.ctx.stores.orders.save(&job).await?;
        self.ctx
            .stores
            .activity
            .append(STREAM, job.id, "skipped", json!({ "reason": reason }), now)
            .await?;
        warn!(job_id = %job.id, attempts = job.attempts, "order sync skipped, stuck on its final attempt");
        Ok(StepOutcome::failed(job.id))
    }

    async fn process(
        &self,
        mut job: JobRecord<OrderSync>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        let activity = &self.ctx.stores.activity;

        let access = match self.ctx.account_access(job.user_id, job.marketplace_id).await? {
            Access::Granted(access) => access,
            Access::Missing(reason) => {
                job.fail(OrderSyncStatus::Skipped, reason, now);
                self.ctx.stores.orders.save(&job).await?;
                activity
                    .append(STREAM, job.id, "skipped", json!({ "reason": reason }), now)
                    .await?;
                warn!(job_id = %job.id, reason, "order sync skipped");
                return Ok(StepOutcome::Deferred { job_id: job.id });
            }
        };
        activity
            .append(STREAM, job.id, "fetch_started", json!({ "attempt": job.attempts }), now)
            .await?;

        match self.fetch(&job, &access, now).await {
            Ok(imported) => {
                job.details.imported = Some(imported);
                job.complete(OrderSyncStatus::Completed, now);
                self.ctx.stores.orders.save(&job).await?;
                activity
                    .append(STREAM, job.id, "completed", json!({ "imported": imported }), now)
                    .await?;
                info!(job_id = %job.id, imported, "order sync completed");
                Ok(StepOutcome::worked(job.id))
            }
            Err(failure) => {
                let settled = settle_failure(
                    &mut job,
                    &self.settings.retry,
                    OrderSyncStatus::Fail,
                    Some(OrderSyncStatus::Skipped),
                    &failure,
                    now,
                );
                self.ctx.stores.orders.save(&job).await?;
                activity
                    .append(STREAM, job.id, "failed", json!({ "error": failure.to_string() }), now)
                    .await?;
                match settled {
                    Settled::Retrying { at } => {
                        warn!(job_id = %job.id, attempts = job.attempts, retry_at = %at, error = %failure, "order sync failed, will retry")
                    }
                    Settled::GaveUp => {
                        warn!(job_id = %job.id, attempts = job.attempts, error = %failure, "order sync skipped after repeated failures")
                    }
                }
                Ok(StepOutcome::failed(job.id))
            }
        }
    }
}

#[async_trait]
impl Worker for OrderSyncWorker {
    fn name(&self) -> &'static str {
        "orders"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = claim_policy(&self.settings, self.scope);
        let Some(job) = self.ctx.stores.orders.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no order sync due");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, attempts = job.attempts, "claimed order sync");
        if policy.exhausted(&job) {
            return self.abandon(job, now).await;
        }

        let claimed = job.clone();
        match self.process(job, now).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let store = self.ctx.stores.orders.as_ref();
                release_claim(store, &claimed, OrderSyncStatus::Running, &error, now, |job, failure, now| {
                    settle_failure(
                        job,
                        &self.settings.retry,
                        OrderSyncStatus::Fail,
                        Some(OrderSyncStatus::Skipped),
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
    use chrono::{Duration as ChronoDuration, TimeZone};

    use crate::testing::{Harness, t0};

    fn settings(max_attempts: u32) -> OrderSyncSettings {
        OrderSyncSettings {
            retry: RetryPolicy::fixed(max_attempts, Duration::from_secs(600)),
            ..Default::default()
        }
    }

    async fn reload(h: &Harness, job: &JobRecord<OrderSync>) -> JobRecord<OrderSync> {
        h.ctx.stores.orders.get(job.id).await.unwrap().unwrap()
    }

    #[test]
    fn window_overlaps_the_previous_run() {
        let settings = OrderSyncSettings::default();
        let now = t0();
        let finished = Utc.with_ymd_and_hms(2026, 4, 18, 6, 30, 0).unwrap();

        assert_eq!(
            order_window(Some(finished), false, &settings, now),
            (finished - ChronoDuration::days(3), now)
        );
        assert_eq!(
            order_window(None, false, &settings, now),
            (now - ChronoDuration::days(14), now)
        );
        assert_eq!(
            order_window(Some(finished), true, &settings, now),
            (now - ChronoDuration::days(14), now)
        );
    }

    #[tokio::test]
    async fn dispatch_refuses_while_open_and_uses_last_completion() {
        let h = Harness::new();
        let settings = settings(5);
        let first = dispatch(&h.ctx, &settings, h.user, h.marketplace, false, t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.details.from, t0() - ChronoDuration::days(14));
        assert!(
            dispatch(&h.ctx, &settings, h.user, h.marketplace, true, t0())
                .await
                .unwrap()
                .is_none()
        );

        let mut done = reload(&h, &first).await;
        let finished = t0() + ChronoDuration::hours(1);
        done.complete(OrderSyncStatus::Completed, finished);
        h.ctx.stores.orders.save(&done).await.unwrap();

        let later = t0() + ChronoDuration::days(1);
        let second = dispatch(&h.ctx, &settings, h.user, h.marketplace, false, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.details.from, finished - ChronoDuration::days(3));
        assert_eq!(second.details.to, later);
    }

    #[tokio::test]
    async fn fetch_upserts_orders() {
        let h = Harness::new();
        let settings = settings(5);
        let job = dispatch(&h.ctx, &settings, h.user, h.marketplace, false, t0())
            .await
            .unwrap()
            .unwrap();
        h.invoker.succeed(
            Action::FetchOrders,
            json!({
                "orders": [
                    { "order_id": "302-1", "order_status": "Shipped", "purchase_date": "2026-04-10T12:00:00Z" },
                    { "order_id": "302-2", "order_status": "Pending", "purchase_date": "2026-04-11T08:00:00Z",
                      "last_update_date": "2026-04-12T08:00:00Z", "buyer": { "name": "x" } }
                ]
            }),
        );

        let worker = OrderSyncWorker::new(h.ctx.clone(), settings);
        assert_eq!(worker.run_once(t0()).await.unwrap(), StepOutcome::worked(job.id));

        let job = reload(&h, &job).await;
        assert_eq!(job.status, OrderSyncStatus::Completed);
        assert_eq!(job.details.imported, Some(2));

        let call = &h.invoker.calls_to(Action::FetchOrders)[0];
        assert_eq!(call.get("created_after"), Some("2026-04-06T09:00:00Z"));
        assert_eq!(call.get("created_before"), Some("2026-04-20T09:00:00Z"));

        let order = h
            .ctx
            .stores
            .commerce
            .order(h.user, h.marketplace, "302-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.payload["buyer"]["name"], "x");
        assert!(!order.is_shipped());

        let steps: Vec<String> = h
            .ctx
            .stores
            .activity
            .history(STREAM, job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.step)
            .collect();
        assert_eq!(steps, ["queued", "fetch_started", "completed"]);
    }

    #[tokio::test]
    async fn failures_back_off_then_skip() {
        let h = Harness::new();
        let job = dispatch(&h.ctx, &settings(2), h.user, h.marketplace, false, t0())
            .await
            .unwrap()
            .unwrap();
        let worker = OrderSyncWorker::new(h.ctx.clone(), settings(2));

        h.invoker.succeed(Action::FetchOrders, json!({ "unexpected": true }));
        assert_eq!(worker.run_once(t0()).await.unwrap(), StepOutcome::failed(job.id));
        let retrying = reload(&h, &job).await;
        assert_eq!(retrying.status, OrderSyncStatus::Fail);
        assert_eq!(retrying.run_after, Some(t0() + ChronoDuration::minutes(10)));

        let later = t0() + ChronoDuration::minutes(10);
        worker.run_once(later).await.unwrap();
        let skipped = reload(&h, &job).await;
        assert_eq!(skipped.status, OrderSyncStatus::Skipped);
        assert_eq!(skipped.attempts, 2);

        // Skipped is terminal and no longer blocks a new dispatch.
        assert!(
            dispatch(&h.ctx, &settings(2), h.user, h.marketplace, false, later)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn stuck_running_job_is_reclaimed() {
        let h = Harness::new();
        let settings = settings(5);
        let job = dispatch(&h.ctx, &settings, h.user, h.marketplace, false, t0())
            .await
            .unwrap()
            .unwrap();

        // A worker claims the job and dies.
        let policy = claim_policy(&settings, JobScope::All);
        h.ctx.stores.orders.claim(&policy, t0()).await.unwrap().unwrap();

        let worker = OrderSyncWorker::new(h.ctx.clone(), settings);
        assert_eq!(
            worker.run_once(t0() + ChronoDuration::minutes(30)).await.unwrap(),
            StepOutcome::Idle
        );

        h.invoker.succeed(Action::FetchOrders, json!({ "orders": [] }));
        let outcome = worker.run_once(t0() + ChronoDuration::hours(2)).await.unwrap();
        assert_eq!(outcome, StepOutcome::worked(job.id));
        assert_eq!(reload(&h, &job).await.attempts, 2);
    }

    #[tokio::test]
    async fn crash_on_the_final_attempt_ends_skipped() {
        let h = Harness::new();
        let settings = settings(2);
        let job = dispatch(&h.ctx, &settings, h.user, h.marketplace, false, t0())
            .await
            .unwrap()
            .unwrap();
        let policy = claim_policy(&settings, JobScope::All);

        // Two workers claim the job in turn and both die mid-fetch.
        h.ctx.stores.orders.claim(&policy, t0()).await.unwrap().unwrap();
        let reclaimed = h
            .ctx
            .stores
            .orders
            .claim(&policy, t0() + ChronoDuration::hours(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);

        let later = t0() + ChronoDuration::days(30);
        let worker = OrderSyncWorker::new(h.ctx.clone(), settings.clone());
        assert_eq!(worker.run_once(later).await.unwrap(), StepOutcome::failed(job.id));
        let skipped = reload(&h, &job).await;
        assert_eq!(skipped.status, OrderSyncStatus::Skipped);
        assert_eq!(skipped.finished_at, Some(later));
        assert!(h.invoker.calls_to(Action::FetchOrders).is_empty());

        assert!(
            dispatch(&h.ctx, &settings, h.user, h.marketplace, false, later)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn storage_error_after_claim_releases_the_job() {
        let h = Harness::new();
        let settings = settings(5);
        let job = dispatch(&h.ctx, &settings, h.user, h.marketplace, false, t0())
            .await
            .unwrap()
            .unwrap();

        let broken = OrderSyncWorker::new(h.ctx_with_unreachable_credentials(), settings.clone());
        assert!(broken.run_once(t0()).await.is_err());
        let released = reload(&h, &job).await;
        assert_eq!(released.status, OrderSyncStatus::Fail);
        assert_eq!(released.attempts, 1);
        assert_eq!(released.run_after, Some(t0() + ChronoDuration::minutes(10)));
        assert!(released.last_error.unwrap().contains("connection reset"));

        h.invoker.succeed(Action::FetchOrders, json!({ "orders": [] }));
        let worker = OrderSyncWorker::new(h.ctx.clone(), settings);
        let outcome = worker.run_once(t0() + ChronoDuration::minutes(10)).await.unwrap();
        assert_eq!(outcome, StepOutcome::worked(job.id));
        assert_eq!(reload(&h, &job).await.status, OrderSyncStatus::Completed);
    }

    #[tokio::test]
    async fn missing_credentials_skip_and_defer() {
        let h = Harness::new();
        let (user, mp) = h.account_without_credentials();
        let job = dispatch(&h.ctx, &settings(5), user, mp, false, t0())
            .await
            .unwrap()
            .unwrap();

        let outcome = OrderSyncWorker::new(h.ctx.clone(), settings(5))
            .run_once(t0())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Deferred { job_id: job.id });
        assert_eq!(reload(&h, &job).await.status, OrderSyncStatus::Skipped);
    }
}
