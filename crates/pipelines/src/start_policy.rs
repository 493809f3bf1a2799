//! Cheap gate consulted before a user-triggered start.
//!
//! Independent of the per-job cooldown inside the claim engine: this one only
//! stops a second sync being queued while one is running or just finished.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use marketsync_core::JobId;
use marketsync_infra::jobs::{JobScope, JobStore, Pipeline};

use crate::error::PipelineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StartDecision {
    Allowed,
    /// A job in an active status exists for the account.
    Active { job_id: JobId },
    /// The newest job was created too recently.
    CoolingDown { until: DateTime<Utc> },
}

impl StartDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, StartDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    pub cooldown: Duration,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(10),
        }
    }
}

impl StartPolicy {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub async fn check<P: Pipeline>(
        &self,
        store: &dyn JobStore<P>,
        scope: JobScope,
        active: &[P::Status],
        now: DateTime<Utc>,
    ) -> PipelineResult<StartDecision> {
        if !active.is_empty() {
            if let Some(job) = store.latest(scope, active).await? {
                return Ok(StartDecision::Active { job_id: job.id });
            }
        }

        if let Some(job) = store.latest(scope, &[]).await? {
            let until = job.created_at + self.cooldown;
            if now < until {
                return Ok(StartDecision::CoolingDown { until });
            }
        }

        Ok(StartDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, t0};
    use marketsync_core::CatalogSyncStatus;
    use marketsync_infra::jobs::{CatalogSync, CatalogSyncDetails, DuplicateRule, NewJob};

    const ACTIVE: &[CatalogSyncStatus] = &[
        CatalogSyncStatus::Pending,
        CatalogSyncStatus::WorkerStarted,
        CatalogSyncStatus::WorkerFetching,
        CatalogSyncStatus::WorkerFetched,
    ];

    #[tokio::test]
    async fn empty_queue_is_allowed() {
        let h = Harness::new();
        let scope = JobScope::account(h.user, h.marketplace);

        let decision = StartPolicy::default()
            .check(h.ctx.stores.catalog.as_ref(), scope, ACTIVE, t0())
            .await
            .unwrap();
        assert_eq!(decision, StartDecision::Allowed);
    }

    #[tokio::test]
    async fn active_job_blocks_then_cooldown_applies() {
        let h = Harness::new();
        let scope = JobScope::account(h.user, h.marketplace);
        let store = h.ctx.stores.catalog.clone();
        let policy = StartPolicy::new(Duration::minutes(10));

        let mut job = store
            .insert(
                NewJob::<CatalogSync>::new(
                    h.user,
                    h.marketplace,
                    "catalog",
                    CatalogSyncStatus::Pending,
                    CatalogSyncDetails::default(),
                ),
                DuplicateRule::AnyStatus,
                t0(),
            )
            .await
            .unwrap()
            .unwrap();

        let decision = policy.check(store.as_ref(), scope, ACTIVE, t0()).await.unwrap();
        assert_eq!(decision, StartDecision::Active { job_id: job.id });

        job.complete(CatalogSyncStatus::Completed, t0() + Duration::minutes(2));
        store.save(&job).await.unwrap();

        let decision = policy
            .check(store.as_ref(), scope, ACTIVE, t0() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(
            decision,
            StartDecision::CoolingDown {
                until: t0() + Duration::minutes(10)
            }
        );

        let later = policy
            .check(store.as_ref(), scope, ACTIVE, t0() + Duration::minutes(10))
            .await
            .unwrap();
        assert!(later.is_allowed());
    }

    #[tokio::test]
    async fn other_accounts_do_not_block() {
        let h = Harness::new();
        let (other_user, mp) = h.account_without_credentials();
        let store = h.ctx.stores.catalog.clone();
        store
            .insert(
                NewJob::<CatalogSync>::new(
                    other_user,
                    mp,
                    "catalog",
                    CatalogSyncStatus::Pending,
                    CatalogSyncDetails::default(),
                ),
                DuplicateRule::AnyStatus,
                t0(),
            )
            .await
            .unwrap();

        let decision = StartPolicy::default()
            .check(
                store.as_ref(),
                JobScope::account(h.user, h.marketplace),
                ACTIVE,
                t0(),
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }
}
