//! Two-phase listing sync.
//!
//! A parent row per ASIN refresh carries a `stage` discriminator
//! (`pending | request | import | completed`) naming the authoritative phase.
//! Dispatch passes open one child row per phase:
//!
//! - request: fetch the catalog item and keep the raw response verbatim,
//! - import: turn the stored response into a listing snapshot and pick the
//!   product image. No external call.
//!
//! Request failures are retried indefinitely on the adapter's suggested delay.
//! Import failures are final for both the child and the parent.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use marketsync_core::{ListingPhaseStatus, ListingStage, ListingSyncStatus, MarketplaceId, UserId};
use marketsync_infra::commerce::{ListingImage, ListingPhase, ListingSnapshot};
use marketsync_infra::external::Action;
use marketsync_infra::jobs::{
    ClaimMark, ClaimOrder, ClaimPolicy, DuplicateRule, JobRecord, JobScope, ListingImport,
    ListingRequest, ListingSync, ListingSyncDetails, NewJob, to_chrono,
};

use crate::backoff::release_claim;
use crate::context::Context;
use crate::error::{JobFailure, PipelineResult, StepResult};
use crate::outcome::{StepOutcome, Worker};

pub const MAIN_VARIANT: &str = "MAIN";

#[derive(Debug, Clone)]
pub struct ListingSyncSettings {
    /// Delay before retrying a failed request when the adapter suggests none.
    pub default_retry_delay: Duration,
    /// Parents handled per dispatch pass.
    pub dispatch_batch: usize,
    /// A `processing` request row untouched this long belongs to a dead worker.
    pub stuck_after: Duration,
}

impl Default for ListingSyncSettings {
    fn default() -> Self {
        Self {
            default_retry_delay: Duration::from_secs(300),
            dispatch_batch: 100,
            stuck_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Queue a listing refresh for every ASIN of the account that has no snapshot
/// yet. ASINs with a parent still in flight are skipped.
pub async fn enqueue_missing(
    ctx: &Context,
    settings: &ListingSyncSettings,
    user_id: UserId,
    marketplace_id: MarketplaceId,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    let asins = ctx
        .stores
        .commerce
        .asins_without_snapshot(user_id, marketplace_id, settings.dispatch_batch)
        .await?;

    let mut created = 0;
    for asin in asins {
        let job = NewJob::<ListingSync>::new(
            user_id,
            marketplace_id,
            asin.id.to_string(),
            ListingSyncStatus::Pending,
            ListingSyncDetails {
                asin_id: asin.id,
                stage: ListingStage::Pending,
            },
        );
        let rule = DuplicateRule::AmongStatuses(vec![
            ListingSyncStatus::Pending,
            ListingSyncStatus::Processing,
        ]);
        if ctx.stores.listings.insert(job, rule, now).await?.is_some() {
            created += 1;
        }
    }
    if created > 0 {
        info!(user_id = %user_id, marketplace_id = %marketplace_id, created, "listing syncs queued");
    }
    Ok(created)
}

/// Open request rows for parents waiting in the `pending` stage.
pub async fn dispatch_requests(
    ctx: &Context,
    settings: &ListingSyncSettings,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    let created = ctx
        .stores
        .listing_phases
        .open_phase(ListingPhase::Request, settings.dispatch_batch, now)
        .await?;
    debug!(phase = "request", created, "listing dispatch pass");
    Ok(created)
}

/// Open import rows for parents whose request phase completed.
pub async fn dispatch_imports(
    ctx: &Context,
    settings: &ListingSyncSettings,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    let created = ctx
        .stores
        .listing_phases
        .open_phase(ListingPhase::Import, settings.dispatch_batch, now)
        .await?;
    debug!(phase = "import", created, "listing dispatch pass");
    Ok(created)
}

/// Uncapped: attempts are counted for visibility only.
pub fn request_claim_policy(
    settings: &ListingSyncSettings,
    scope: JobScope,
) -> ClaimPolicy<ListingPhaseStatus> {
    ClaimPolicy::new([ListingPhaseStatus::Pending, ListingPhaseStatus::Fail], |_| {
        ClaimMark::attempt(ListingPhaseStatus::Processing)
    })
    .ordered_by(ClaimOrder::RunAfter)
    .reclaim_stuck(ListingPhaseStatus::Processing, to_chrono(settings.stuck_after))
    .scoped(scope)
}

/// Imports make no external call; one stuck this long is simply run again.
const IMPORT_STUCK_AFTER: Duration = Duration::from_secs(30 * 60);

pub fn import_claim_policy(scope: JobScope) -> ClaimPolicy<ListingPhaseStatus> {
    ClaimPolicy::new([ListingPhaseStatus::Pending], |_| {
        ClaimMark::attempt(ListingPhaseStatus::Processing)
    })
    .reclaim_stuck(ListingPhaseStatus::Processing, to_chrono(IMPORT_STUCK_AFTER))
    .scoped(scope)
}

pub struct ListingRequestWorker {
    ctx: Context,
    settings: ListingSyncSettings,
    scope: JobScope,
}

impl ListingRequestWorker {
    pub fn new(ctx: Context, settings: ListingSyncSettings) -> Self {
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

    async fn fetch(&self, job: &JobRecord<ListingRequest>) -> StepResult<JsonValue> {
        let parent = self
            .ctx
            .stores
            .listings
            .get(job.details.parent_id)
            .await?
            .ok_or(JobFailure::Precondition("listing sync parent not found"))?;
        let asin = self
            .ctx
            .stores
            .commerce
            .asin(parent.details.asin_id)
            .await?
            .ok_or(JobFailure::Precondition("asin not found"))?;
        let access = self.ctx.require_access(job.user_id, job.marketplace_id).await?;

        let request = access
            .request(Action::GetCatalogItem, job.id)
            .arg("asin", &asin.asin);
        let envelope = self.ctx.run(&request).await?;
        Ok(envelope.data)
    }

    /// Child and parent both end in `error`.
    async fn abandon(
        &self,
        mut job: JobRecord<ListingRequest>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        job.fail(ListingPhaseStatus::Error, reason, now);
        self.ctx.stores.listing_requests.save(&job).await?;
        if let Some(mut parent) = self.ctx.stores.listings.get(job.details.parent_id).await? {
            parent.fail(ListingSyncStatus::Error, reason, now);
            self.ctx.stores.listings.save(&parent).await?;
        }
        warn!(job_id = %job.id, parent_id = %job.details.parent_id, reason, "listing request abandoned");
        Ok(())
    }

    /// The adapter's positive `retry_after_minutes`, else the configured default.
    fn retry_delay(&self, failure: &JobFailure) -> chrono::Duration {
        failure
            .retry_after_minutes()
            .filter(|m| *m > 0)
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or_else(|| to_chrono(self.settings.default_retry_delay))
    }

    async fn process(
        &self,
        mut job: JobRecord<ListingRequest>,
        now: DateTime<Utc>,
    ) -> PipelineResult<StepOutcome> {
        match self.fetch(&job).await {
            Ok(response) => {
                self.ctx
                    .touch_credentials(job.user_id, job.marketplace_id, now)
                    .await;
                job.details.response = Some(response);
                self.ctx.stores.listing_phases.complete_request(&job, now).await?;
                info!(job_id = %job.id, parent_id = %job.details.parent_id, "listing request completed");
                Ok(StepOutcome::worked(job.id))
            }
            Err(JobFailure::Precondition(reason)) => {
                let job_id = job.id;
                self.abandon(job, reason, now).await?;
                Ok(StepOutcome::Deferred { job_id })
            }
            Err(failure) => {
                let retry_at = now + self.retry_delay(&failure);
                job.retry_at(ListingPhaseStatus::Fail, failure.to_string(), retry_at, now);
                self.ctx.stores.listing_requests.save(&job).await?;
                warn!(job_id = %job.id, attempts = job.attempts, retry_at = %retry_at, error = %failure, "listing request failed, will retry");
                Ok(StepOutcome::failed(job.id))
            }
        }
    }
}

#[async_trait]
impl Worker for ListingRequestWorker {
    fn name(&self) -> &'static str {
        "listing-request"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = request_claim_policy(&self.settings, self.scope);
        let Some(job) = self.ctx.stores.listing_requests.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no listing request due");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, parent_id = %job.details.parent_id, attempts = job.attempts, "claimed listing request");

        let claimed = job.clone();
        match self.process(job, now).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let store = self.ctx.stores.listing_requests.as_ref();
                release_claim(store, &claimed, ListingPhaseStatus::Processing, &error, now, |job, failure, now| {
                    let retry_at = now + self.retry_delay(failure);
                    job.retry_at(ListingPhaseStatus::Fail, failure.to_string(), retry_at, now);
                })
                .await;
                Err(error)
            }
        }
    }
}

/// The part of a catalog item response the import relies on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogItem {
    pub asin: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub images: Vec<ListingImage>,
}

/// Smallest `MAIN` image by area. A missing dimension sorts last; the first of
/// equal candidates wins.
pub fn smallest_main_image(images: &[ListingImage]) -> Option<&ListingImage> {
    images
        .iter()
        .filter(|image| image.variant == MAIN_VARIANT)
        .min_by_key(|image| match (image.width, image.height) {
            (Some(w), Some(h)) => u64::from(w) * u64::from(h),
            _ => u64::MAX,
        })
}

pub struct ListingImportWorker {
    ctx: Context,
    scope: JobScope,
}

impl ListingImportWorker {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            scope: JobScope::All,
        }
    }

    pub fn scoped(mut self, scope: JobScope) -> Self {
        self.scope = scope;
        self
    }

    async fn import(&self, job: &JobRecord<ListingImport>, now: DateTime<Utc>) -> StepResult<()> {
        let (parent, request) = self
            .ctx
            .stores
            .listing_phases
            .import_inputs(job)
            .await?
            .ok_or(JobFailure::Precondition("parent or completed request row missing"))?;
        let asin = self
            .ctx
            .stores
            .commerce
            .asin(parent.details.asin_id)
            .await?
            .ok_or(JobFailure::Precondition("asin not found"))?;

        let payload = request
            .details
            .response
            .ok_or_else(|| JobFailure::data("request row has no stored response"))?;
        let item: CatalogItem = serde_json::from_value(payload.clone())
            .map_err(|e| JobFailure::data(format!("catalog item: {e}")))?;
        if item.asin != asin.asin {
            return Err(JobFailure::data(format!(
                "catalog item is for {} instead of {}",
                item.asin, asin.asin
            )));
        }

        let snapshot = ListingSnapshot {
            user_id: job.user_id,
            marketplace_id: job.marketplace_id,
            asin: item.asin.clone(),
            title: item.title.clone(),
            brand: item.brand.clone(),
            product_type: item.product_type.clone(),
            payload,
            synced_at: now,
        };
        let image = smallest_main_image(&item.images);
        self.ctx
            .stores
            .listing_phases
            .finish_import(job, asin.id, &snapshot, image, now)
            .await?;
        info!(job_id = %job.id, parent_id = %job.details.parent_id, asin = %item.asin, image = image.is_some(), "listing imported");
        Ok(())
    }
}

#[async_trait]
impl Worker for ListingImportWorker {
    fn name(&self) -> &'static str {
        "listing-import"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> PipelineResult<StepOutcome> {
        let policy = import_claim_policy(self.scope);
        let Some(job) = self.ctx.stores.listing_imports.claim(&policy, now).await? else {
            debug!(pipeline = self.name(), "no listing import due");
            return Ok(StepOutcome::Idle);
        };
        debug!(job_id = %job.id, parent_id = %job.details.parent_id, "claimed listing import");

        match self.import(&job, now).await {
            Ok(()) => Ok(StepOutcome::worked(job.id)),
            Err(failure) => {
                self.ctx
                    .stores
                    .listing_phases
                    .fail_import(&job, &failure.to_string(), now)
                    .await?;
                warn!(job_id = %job.id, parent_id = %job.details.parent_id, error = %failure, "listing import failed");
                Ok(StepOutcome::failed(job.id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use serde_json::json;

    use marketsync_core::AsinId;
    use marketsync_infra::external::Envelope;

    use crate::testing::{Harness, t0};

    fn image(variant: &str, width: Option<u32>, height: Option<u32>, link: &str) -> ListingImage {
        ListingImage {
            variant: variant.into(),
            link: link.into(),
            width,
            height,
        }
    }

    async fn parent_for(h: &Harness, asin: &str) -> (AsinId, JobRecord<ListingSync>) {
        let record = h
            .ctx
            .stores
            .commerce
            .ensure_asin(h.user, h.marketplace, asin)
            .await
            .unwrap();
        enqueue_missing(&h.ctx, &ListingSyncSettings::default(), h.user, h.marketplace, t0())
            .await
            .unwrap();
        let parent = h
            .ctx
            .stores
            .listings
            .latest(JobScope::account(h.user, h.marketplace), &[])
            .await
            .unwrap()
            .unwrap();
        (record.id, parent)
    }

    async fn parent(h: &Harness, job: &JobRecord<ListingSync>) -> JobRecord<ListingSync> {
        h.ctx.stores.listings.get(job.id).await.unwrap().unwrap()
    }

    #[test]
    fn picks_the_smallest_main_image() {
        let images = vec![
            image("MAIN", Some(500), Some(500), "big"),
            image("MAIN", Some(100), Some(100), "small"),
            image("PT01", Some(10), Some(10), "swatch"),
        ];
        assert_eq!(smallest_main_image(&images).unwrap().link, "small");
    }

    #[test]
    fn missing_dimensions_sort_last_and_ties_keep_the_first() {
        let images = vec![
            image("MAIN", None, Some(1), "unknown"),
            image("MAIN", Some(20), Some(20), "first"),
            image("MAIN", Some(40), Some(10), "second"),
        ];
        assert_eq!(smallest_main_image(&images).unwrap().link, "first");

        let only_unknown = vec![image("MAIN", None, None, "unknown")];
        assert_eq!(smallest_main_image(&only_unknown).unwrap().link, "unknown");

        let none = vec![image("PT01", Some(1), Some(1), "swatch")];
        assert!(smallest_main_image(&none).is_none());
    }

    proptest! {
        #[test]
        fn selection_is_a_main_image_of_minimal_area(
            dims in proptest::collection::vec((any::<bool>(), 1u32..2000, 1u32..2000), 0..12)
        ) {
            let images: Vec<ListingImage> = dims
                .iter()
                .enumerate()
                .map(|(i, (main, w, h))| {
                    image(if *main { "MAIN" } else { "PT01" }, Some(*w), Some(*h), &i.to_string())
                })
                .collect();
            let area = |img: &ListingImage| u64::from(img.width.unwrap()) * u64::from(img.height.unwrap());

            match smallest_main_image(&images) {
                Some(picked) => {
                    prop_assert_eq!(picked.variant.as_str(), MAIN_VARIANT);
                    let best = images.iter().filter(|i| i.variant == MAIN_VARIANT).map(area).min();
                    prop_assert_eq!(Some(area(picked)), best);
                }
                None => prop_assert!(images.iter().all(|i| i.variant != MAIN_VARIANT)),
            }
        }
    }

    #[tokio::test]
    async fn enqueue_skips_asins_in_flight() {
        let h = Harness::new();
        parent_for(&h, "B00AAA").await;

        let again = enqueue_missing(&h.ctx, &ListingSyncSettings::default(), h.user, h.marketplace, t0())
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn request_then_import_completes_the_parent() {
        let h = Harness::new();
        let settings = ListingSyncSettings::default();
        let (asin_id, job) = parent_for(&h, "B00AAA").await;

        assert_eq!(dispatch_requests(&h.ctx, &settings, t0()).await.unwrap(), 1);
        assert_eq!(dispatch_requests(&h.ctx, &settings, t0()).await.unwrap(), 0);
        let opened = parent(&h, &job).await;
        assert_eq!(opened.status, ListingSyncStatus::Processing);
        assert_eq!(opened.details.stage, ListingStage::Request);

        let response = json!({
            "asin": "B00AAA",
            "title": "Kettle",
            "brand": "Acme",
            "images": [
                { "variant": "MAIN", "link": "https://img/500", "width": 500, "height": 500 },
                { "variant": "MAIN", "link": "https://img/100", "width": 100, "height": 100 },
                { "variant": "PT01", "link": "https://img/10", "width": 10, "height": 10 }
            ]
        });
        h.invoker.succeed(Action::GetCatalogItem, response.clone());
        let requests = ListingRequestWorker::new(h.ctx.clone(), settings.clone());
        assert!(requests.run_once(t0()).await.unwrap().repoll_immediately());
        assert_eq!(h.invoker.calls_to(Action::GetCatalogItem)[0].get("asin"), Some("B00AAA"));

        let handed_over = parent(&h, &job).await;
        assert_eq!(handed_over.status, ListingSyncStatus::Pending);
        assert_eq!(handed_over.details.stage, ListingStage::Import);

        assert_eq!(dispatch_imports(&h.ctx, &settings, t0()).await.unwrap(), 1);
        let imports = ListingImportWorker::new(h.ctx.clone());
        assert!(imports.run_once(t0()).await.unwrap().repoll_immediately());

        let done = parent(&h, &job).await;
        assert_eq!(done.status, ListingSyncStatus::Completed);
        assert_eq!(done.details.stage, ListingStage::Completed);

        let snapshot = h
            .ctx
            .stores
            .commerce
            .listing_snapshot(h.user, h.marketplace, "B00AAA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.title.as_deref(), Some("Kettle"));
        assert_eq!(snapshot.payload, response);
        let asin = h.ctx.stores.commerce.asin(asin_id).await.unwrap().unwrap();
        assert_eq!(asin.image.unwrap().link, "https://img/100");

        assert_eq!(imports.run_once(t0()).await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn request_failures_retry_without_a_cap() {
        let h = Harness::new();
        let settings = ListingSyncSettings::default();
        parent_for(&h, "B00AAA").await;
        dispatch_requests(&h.ctx, &settings, t0()).await.unwrap();
        let worker = ListingRequestWorker::new(h.ctx.clone(), settings);

        let mut now = t0();
        for _ in 0..7 {
            assert!(!matches!(
                worker.run_once(now).await.unwrap(),
                StepOutcome::Idle | StepOutcome::Deferred { .. }
            ));
            now += ChronoDuration::minutes(5);
        }

        let child = h
            .ctx
            .stores
            .listing_requests
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.status, ListingPhaseStatus::Fail);
        assert_eq!(child.attempts, 7);

        h.invoker.reply(
            Action::GetCatalogItem,
            Ok(Envelope {
                success: false,
                error_message: Some("QuotaExceeded".into()),
                retry_after_minutes: Some(45),
                ..Default::default()
            }),
        );
        worker.run_once(now).await.unwrap();
        let child = h.ctx.stores.listing_requests.get(child.id).await.unwrap().unwrap();
        assert_eq!(child.run_after, Some(now + ChronoDuration::minutes(45)));
        assert!(child.last_error.unwrap().contains("QuotaExceeded"));
    }

    #[tokio::test]
    async fn credential_store_outage_is_retried() {
        let h = Harness::new();
        let settings = ListingSyncSettings::default();
        parent_for(&h, "B00AAA").await;
        dispatch_requests(&h.ctx, &settings, t0()).await.unwrap();

        let broken = ListingRequestWorker::new(h.ctx_with_unreachable_credentials(), settings.clone());
        assert!(broken.run_once(t0()).await.unwrap().repoll_immediately());
        let child = h
            .ctx
            .stores
            .listing_requests
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.status, ListingPhaseStatus::Fail);
        assert_eq!(child.run_after, Some(t0() + ChronoDuration::minutes(5)));
        assert!(h.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn stuck_request_is_claimed_again() {
        let h = Harness::new();
        let settings = ListingSyncSettings::default();
        parent_for(&h, "B00AAA").await;
        dispatch_requests(&h.ctx, &settings, t0()).await.unwrap();

        let policy = request_claim_policy(&settings, JobScope::All);
        let child = h.ctx.stores.listing_requests.claim(&policy, t0()).await.unwrap().unwrap();
        let worker = ListingRequestWorker::new(h.ctx.clone(), settings);
        assert_eq!(
            worker.run_once(t0() + ChronoDuration::minutes(10)).await.unwrap(),
            StepOutcome::Idle
        );

        h.invoker.succeed(Action::GetCatalogItem, json!({ "asin": "B00AAA" }));
        let later = t0() + ChronoDuration::minutes(31);
        assert_eq!(worker.run_once(later).await.unwrap(), StepOutcome::worked(child.id));
    }

    #[tokio::test]
    async fn missing_credentials_abandon_both_rows() {
        let h = Harness::new();
        let (user, mp) = h.account_without_credentials();
        h.ctx.stores.commerce.ensure_asin(user, mp, "B00BBB").await.unwrap();
        enqueue_missing(&h.ctx, &ListingSyncSettings::default(), user, mp, t0())
            .await
            .unwrap();
        dispatch_requests(&h.ctx, &ListingSyncSettings::default(), t0())
            .await
            .unwrap();

        let worker = ListingRequestWorker::new(h.ctx.clone(), ListingSyncSettings::default());
        let outcome = worker.run_once(t0()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Deferred { .. }));

        let parent = h
            .ctx
            .stores
            .listings
            .latest(JobScope::account(user, mp), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parent.status, ListingSyncStatus::Error);
        assert!(h.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_response_fails_import_and_parent() {
        let h = Harness::new();
        let settings = ListingSyncSettings::default();
        let (_, job) = parent_for(&h, "B00AAA").await;
        dispatch_requests(&h.ctx, &settings, t0()).await.unwrap();
        h.invoker.succeed(Action::GetCatalogItem, json!({ "items": [] }));
        ListingRequestWorker::new(h.ctx.clone(), settings.clone())
            .run_once(t0())
            .await
            .unwrap();
        dispatch_imports(&h.ctx, &settings, t0()).await.unwrap();

        let outcome = ListingImportWorker::new(h.ctx.clone()).run_once(t0()).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Worked { succeeded: false, .. }));

        let failed = parent(&h, &job).await;
        assert_eq!(failed.status, ListingSyncStatus::Error);
        assert!(failed.last_error.unwrap().contains("catalog item"));
        let import = h
            .ctx
            .stores
            .listing_imports
            .latest(JobScope::All, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(import.status, ListingPhaseStatus::Error);
    }
}
