//! Line items of shipped orders.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use marketsync_core::OrderItemsStatus;
use marketsync_infra::commerce::OrderItem;
use marketsync_infra::external::Action;
use marketsync_infra::jobs::{
    ClaimMark, ClaimOrder, ClaimPolicy, DuplicateRule, JobRecord, JobScope, NewJob,
    OrderItemsDetails, OrderItemsSync, RetryPolicy, to_chrono,
};

use crate::backoff::{Settled, release_claim, settle_failure};
use crate::context::{Access, AccountAccess, Context};
use crate::error::{JobFailure, PipelineResult, StepResult};
use crate::outcome::{StepOutcome, Worker};

#[derive(Debug, Clone)]
pub struct OrderItemsSettings {
    pub retry: RetryPolicy,
    /// Orders scanned per dispatch pass.
    pub dispatch_batch: usize,
    /// A `processing` row untouched this long belongs to a dead worker.
    pub stuck_after: Duration,
}

impl Default for OrderItemsSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(5, Duration::from_secs(300), Duration::from_secs(6 * 3600)),
            dispatch_batch: 200,
            stuck_after: Duration::from_secs(30 * 60),
        }
    }
}

pub fn claim_policy(settings: &OrderItemsSettings, scope: JobScope) -> ClaimPolicy<OrderItemsStatus> {
    ClaimPolicy::new([OrderItemsStatus::Pending, OrderItemsStatus::Fail], |_| {
        ClaimMark::attempt(OrderItemsStatus::Processing)
    })
    .ordered_by(ClaimOrder::RunAfter)
    .max_attempts(settings.retry.max_attempts)
    .reclaim_stuck(OrderItemsStatus::Processing, to_chrono(settings.stuck_after))
    .scoped(scope)
}

/// One row per shipped order whose items were never fetched.
pub async fn dispatch(
    ctx: &Context,
    settings: &OrderItemsSettings,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    let orders = ctx
        .stores
        .commerce
        .shipped_orders_awaiting_items(settings.dispatch_batch)
        .await?;

    let mut created = 0;
    for order in orders {
        let job = NewJob::<OrderItemsSync>::new(
            order.user_id,
            order.marketplace_id,
            order.order_id.clone(),
            OrderItemsStatus::Pending,
            OrderItemsDetails {
                order_id: order.order_id,
                item_count: None,
            },
        );
        if ctx
            .stores
            .order_items
            .insert(job, DuplicateRule::AnyStatus, now)
            .await?
            .is_some()
        {
            created += 1;
        }
    }
    debug!(created, "order items dispatch pass");
    Ok(created)
}

pub struct OrderItemsWorker {
    ctx: Context,
    settings: OrderItemsSettings,
    scope: JobScope,
}

impl OrderItemsWorker {
    pub fn new(ctx: Context, settings: OrderItemsSettings) -> Self {
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
        job: &JobRecord<OrderItemsSync>,
        access: &AccountAccess,
        now: DateTime<Utc>,
    ) -> StepResult<u32> {
        let request = access
            .request(Action::FetchOrderItems, job.id)
            .arg("order_id", &job.details.order_id);
        let envelope = self.ctx.run(&request).await?;
        self.ctx
            .touch_credentials(job.user_id, job.marketplace_id, now)
            .await;

        let items: Vec<OrderItem> = match envelope.data.get("items") {
            Some(items) => serde_json::from_value(items.clone())
                .map_err(|e| JobFailure::data(format!("order items: {e}")))?,
            None => return Err(JobFailure::data("fetch_order_items returned no items list")),
        };
        self.ctx
            .stores
            .commerce
            .record_order_items(
                job.user_id,
                job.marketplace_id,
                &job.details.order_id,
                &items,
                now,
            )
            .await?;
        Ok(u32::try_from(items.len()).unwrap_or(u32::MAX))
    }

    async fn process(
        &self,
        mut job: JobRecord<OrderItemsSync>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        // Retrying cannot fix a missing credential: skip and report no work
        // so the loop sleeps instead of spinning through the account's rows.
        let access = match self.ctx.account_access(job.user_id, job.marketplace_id).await? {
            Access::Granted(access) => access,
            Access::Missing(reason) => {
                job.fail(OrderItemsStatus::Skipped, reason, now);
                self.ctx.stores.order_items.save(&job).await?;
                warn!(job_id = %job.id, order_id = %job.details.order_id, reason, "order items skipped");
                return Ok(StepOutcome::Deferred { job_id: job.id });
            }
        };

        match self.fetch(&job, &access, now).await {
            Ok(count) => {
                job.details.item_count = Some(count);
                job.complete(OrderItemsStatus::Completed, now);
                self.ctx.stores.order_items.save(&job).await?;
                info!(job_id = %job.id, order_id = %job.details.order_id, items = count, "order items imported");
                Ok(StepOutcome::worked(job.id))
            }
            Err(failure) => {
                let settled = settle_failure(
                    &mut job,
                    &self.settings.retry,
                    OrderItemsStatus::Fail,
                    Some(OrderItemsStatus::Skipped),
                    &failure,
                    now,
                );
                self.ctx.stores.order_items.save(&job).await?;
                match settled {
                    Settled::Retrying { at } => {
                        warn!(job_id = %job.id, attempts = job.attempts, retry_at = %at, error = %failure, "order items failed, will retry")
                    }
                    Settled::GaveUp => {
                        warn!(job_id = %job.id, attempts = job.attempts, error = %failure, "order items skipped after repeated failures")
                    }
                }
                Ok(StepOutcome::failed(job.id))
            }
        }
    }
}

#[async_trait]
impl Worker for OrderItemsWorker {
    fn name(&self) -> &'static str {
        "order-items"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = claim_policy(&self.settings, self.scope);
        let Some(mut job) = self.ctx.stores.order_items.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no order items due");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, order_id = %job.details.order_id, attempts = job.attempts, "claimed order items");
        if policy.exhausted(&job) {
            job.fail(OrderItemsStatus::Skipped, "worker stopped during the final attempt", now);
            self.ctx.stores.order_items.save(&job).await?;
            warn!(job_id = %job.id, order_id = %job.details.order_id, "order items skipped, stuck on its final attempt");
            return Ok(StepOutcome::failed(job.id));
        }

        let claimed = job.clone();
        match self.process(job, now).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let store = self.ctx.stores.order_items.as_ref();
                release_claim(store, &claimed, OrderItemsStatus::Processing, &error, now, |job, failure, now| {
                    settle_failure(
                        job,
                        &self.settings.retry,
                        OrderItemsStatus::Fail,
                        Some(OrderItemsStatus::Skipped),
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

    use marketsync_core::{MarketplaceId, UserId};
    use marketsync_infra::commerce::OrderRecord;

    use crate::testing::{Harness, t0};

    fn order(user: UserId, mp: MarketplaceId, id: &str, status: &str, days_ago: i64) -> OrderRecord {
        OrderRecord {
            user_id: user,
            marketplace_id: mp,
            order_id: id.into(),
            order_status: status.into(),
            purchase_date: t0() - ChronoDuration::days(days_ago),
            last_update_date: None,
            items_imported: false,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn dispatch_takes_shipped_orders_once() {
        let h = Harness::new();
        h.ctx
            .stores
            .commerce
            .upsert_orders(
                &[
                    order(h.user, h.marketplace, "A", "Shipped", 3),
                    order(h.user, h.marketplace, "B", "Pending", 2),
                    order(h.user, h.marketplace, "C", "Shipped", 5),
                ],
                t0(),
            )
            .await
            .unwrap();

        let settings = OrderItemsSettings::default();
        assert_eq!(dispatch(&h.ctx, &settings, t0()).await.unwrap(), 2);
        assert_eq!(dispatch(&h.ctx, &settings, t0()).await.unwrap(), 0);

        // Oldest purchase first.
        let first = h
            .ctx
            .stores
            .order_items
            .list(JobScope::All, &[], 10)
            .await
            .unwrap();
        assert_eq!(first[0].details.order_id, "C");
        assert_eq!(first[1].details.order_id, "A");
    }

    #[tokio::test]
    async fn fetched_items_are_recorded() {
        let h = Harness::new();
        h.ctx
            .stores
            .commerce
            .upsert_orders(&[order(h.user, h.marketplace, "A", "Shipped", 3)], t0())
            .await
            .unwrap();
        dispatch(&h.ctx, &OrderItemsSettings::default(), t0()).await.unwrap();
        h.invoker.succeed(
            Action::FetchOrderItems,
            json!({ "items": [
                { "asin": "B00AAA", "seller_sku": "SKU-1", "quantity": 2 },
                { "asin": "B00BBB" }
            ] }),
        );

        let worker = OrderItemsWorker::new(h.ctx.clone(), OrderItemsSettings::default());
        assert!(worker.run_once(t0()).await.unwrap().repoll_immediately());

        let items = h
            .ctx
            .stores
            .commerce
            .order_items(h.user, h.marketplace, "A")
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].quantity, 1);
        let order = h
            .ctx
            .stores
            .commerce
            .order(h.user, h.marketplace, "A")
            .await
            .unwrap()
            .unwrap();
        assert!(order.items_imported);
        assert_eq!(h.invoker.calls_to(Action::FetchOrderItems)[0].get("order_id"), Some("A"));

        let job = h
            .ctx
            .stores
            .order_items
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, OrderItemsStatus::Completed);
        assert_eq!(job.details.item_count, Some(2));
    }

    #[tokio::test]
    async fn missing_credentials_report_no_work() {
        let h = Harness::new();
        let (user, mp) = h.account_without_credentials();
        h.ctx
            .stores
            .commerce
            .upsert_orders(&[order(user, mp, "A", "Shipped", 3)], t0())
            .await
            .unwrap();
        dispatch(&h.ctx, &OrderItemsSettings::default(), t0()).await.unwrap();

        let worker = OrderItemsWorker::new(h.ctx.clone(), OrderItemsSettings::default());
        let outcome = worker.run_once(t0()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Deferred { .. }));
        assert!(!outcome.repoll_immediately());

        let job = h
            .ctx
            .stores
            .order_items
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, OrderItemsStatus::Skipped);
        assert_eq!(worker.run_once(t0()).await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn ordinary_failures_report_work_and_retry() {
        let h = Harness::new();
        h.ctx
            .stores
            .commerce
            .upsert_orders(&[order(h.user, h.marketplace, "A", "Shipped", 3)], t0())
            .await
            .unwrap();
        dispatch(&h.ctx, &OrderItemsSettings::default(), t0()).await.unwrap();
        h.invoker.fail(Action::FetchOrderItems, "InvalidInput", Some(20));

        let worker = OrderItemsWorker::new(h.ctx.clone(), OrderItemsSettings::default());
        let outcome = worker.run_once(t0()).await.unwrap();
        assert!(outcome.repoll_immediately());

        let job = h
            .ctx
            .stores
            .order_items
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, OrderItemsStatus::Fail);
        assert_eq!(job.run_after, Some(t0() + ChronoDuration::minutes(20)));
    }

    #[tokio::test]
    async fn storage_error_after_claim_leaves_the_order_retryable() {
        let h = Harness::new();
        h.ctx
            .stores
            .commerce
            .upsert_orders(&[order(h.user, h.marketplace, "A", "Shipped", 3)], t0())
            .await
            .unwrap();
        let settings = OrderItemsSettings::default();
        dispatch(&h.ctx, &settings, t0()).await.unwrap();

        let broken = OrderItemsWorker::new(h.ctx_with_unreachable_credentials(), settings.clone());
        assert!(broken.run_once(t0()).await.is_err());
        let job = h
            .ctx
            .stores
            .order_items
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, OrderItemsStatus::Fail);
        assert!(job.last_error.as_deref().unwrap().contains("connection reset"));

        h.invoker.succeed(
            Action::FetchOrderItems,
            json!({ "items": [{ "asin": "B00AAA", "quantity": 1 }] }),
        );
        let worker = OrderItemsWorker::new(h.ctx.clone(), settings.clone());
        let later = t0() + ChronoDuration::days(30);
        assert_eq!(worker.run_once(later).await.unwrap(), StepOutcome::worked(job.id));
        assert_eq!(dispatch(&h.ctx, &settings, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stuck_row_on_its_final_attempt_is_skipped() {
        let h = Harness::new();
        h.ctx
            .stores
            .commerce
            .upsert_orders(&[order(h.user, h.marketplace, "A", "Shipped", 3)], t0())
            .await
            .unwrap();
        let settings = OrderItemsSettings {
            retry: RetryPolicy::fixed(1, Duration::from_secs(600)),
            ..Default::default()
        };
        dispatch(&h.ctx, &settings, t0()).await.unwrap();

        // The only allowed attempt dies with its worker.
        let policy = claim_policy(&settings, JobScope::All);
        let job = h.ctx.stores.order_items.claim(&policy, t0()).await.unwrap().unwrap();
        let worker = OrderItemsWorker::new(h.ctx.clone(), settings);
        assert_eq!(
            worker.run_once(t0() + ChronoDuration::minutes(10)).await.unwrap(),
            StepOutcome::Idle
        );

        let later = t0() + ChronoDuration::hours(1);
        assert_eq!(worker.run_once(later).await.unwrap(), StepOutcome::failed(job.id));
        let job = h.ctx.stores.order_items.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, OrderItemsStatus::Skipped);
        assert!(h.invoker.calls_to(Action::FetchOrderItems).is_empty());
    }
}
