//! In-memory implementation of every storage trait.
//!
//! Intended for tests/dev. One mutex guards all tables, so every trait method
//! behaves like a serializable transaction and a claim is trivially exclusive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use marketsync_core::{
    AsinId, JobId, JobState, ListingPhaseStatus, ListingStage, ListingSyncStatus, MarketplaceId, UserId,
};

use crate::accounts::{CredentialBundle, CredentialProvider, MarketplaceDirectory, MarketplaceInfo};
use crate::activity::{ActivityEntry, ActivityLog, ActivityStream};
use crate::commerce::{
    AsinRecord, CommerceRepository, ListingImage, ListingPhase, ListingSnapshot, ListingStore,
    OrderItem, OrderRecord, ReviewCandidate, ReviewSetting,
};
use crate::jobs::{
    ClaimPolicy, DuplicateRule, JobRecord, JobRow, JobScope, JobStore, ListingImport,
    ListingImportDetails, ListingRequest, ListingRequestDetails, ListingSync, NewJob,
    OrderItemsSync, Pipeline, ReviewRequest, StatusCounts, StoreError,
};

type AccountKey = (UserId, MarketplaceId);
type AccountItemKey = (UserId, MarketplaceId, String);

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    jobs: HashMap<&'static str, BTreeMap<i64, JobRow>>,
    activity: HashMap<ActivityStream, Vec<ActivityEntry>>,
    credentials: HashMap<AccountKey, CredentialBundle>,
    credentials_used: HashMap<AccountKey, DateTime<Utc>>,
    marketplaces: HashMap<MarketplaceId, MarketplaceInfo>,
    asins: BTreeMap<i64, AsinRecord>,
    snapshots: HashMap<AccountItemKey, ListingSnapshot>,
    orders: BTreeMap<AccountItemKey, OrderRecord>,
    order_items: HashMap<AccountItemKey, Vec<OrderItem>>,
    review_settings: Vec<ReviewSetting>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn table(&mut self, table: &'static str) -> &mut BTreeMap<i64, JobRow> {
        self.jobs.entry(table).or_default()
    }

    fn rows<P: Pipeline>(&self) -> Result<Vec<JobRecord<P>>, StoreError> {
        self.jobs
            .get(P::TABLE)
            .into_iter()
            .flat_map(|t| t.values())
            .map(|row| row.clone().decode::<P>())
            .collect()
    }

    fn get<P: Pipeline>(&self, id: JobId) -> Result<Option<JobRecord<P>>, StoreError> {
        self.jobs
            .get(P::TABLE)
            .and_then(|t| t.get(&id.get()))
            .map(|row| row.clone().decode::<P>())
            .transpose()
    }

    fn put<P: Pipeline>(&mut self, job: &JobRecord<P>) -> Result<(), StoreError> {
        let row = JobRow::encode(job)?;
        match self.table(P::TABLE).get_mut(&row.id) {
            Some(slot) => {
                *slot = row;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                table: P::TABLE,
                id: job.id,
            }),
        }
    }

    fn insert<P: Pipeline>(
        &mut self,
        job: NewJob<P>,
        rule: &DuplicateRule<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        let duplicate = self.rows::<P>()?.into_iter().any(|existing| {
            existing.user_id == job.user_id
                && existing.marketplace_id == job.marketplace_id
                && existing.natural_key == job.natural_key
                && rule.blocks(existing.status)
        });
        if duplicate {
            return Ok(None);
        }

        let record = JobRecord::<P> {
            id: JobId::new(self.next_id()),
            user_id: job.user_id,
            marketplace_id: job.marketplace_id,
            natural_key: job.natural_key,
            status: job.status,
            attempts: 0,
            run_after: job.run_after,
            started_at: None,
            finished_at: None,
            last_error: None,
            details: job.details,
            created_at: now,
            updated_at: now,
        };
        let row = JobRow::encode(&record)?;
        self.table(P::TABLE).insert(row.id, row);
        Ok(Some(record))
    }

    fn has_job<P: Pipeline>(&self, user_id: UserId, marketplace_id: MarketplaceId, key: &str) -> bool {
        let (user, marketplace) = (*user_id.as_uuid(), *marketplace_id.as_uuid());
        self.jobs.get(P::TABLE).is_some_and(|t| {
            t.values().any(|row| {
                row.user_id == user && row.marketplace_id == marketplace && row.natural_key == key
            })
        })
    }

    fn last_activity(&self, stream: ActivityStream, job_id: JobId) -> Option<DateTime<Utc>> {
        self.activity
            .get(&stream)?
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.created_at)
            .max()
    }
}

/// In-memory store backing every storage trait of the crate.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    pub fn seed_credentials(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        bundle: CredentialBundle,
    ) -> Result<(), StoreError> {
        self.lock()?
            .credentials
            .insert((user_id, marketplace_id), bundle);
        Ok(())
    }

    pub fn seed_marketplace(&self, info: MarketplaceInfo) -> Result<(), StoreError> {
        self.lock()?.marketplaces.insert(info.id, info);
        Ok(())
    }

    pub fn seed_review_setting(&self, setting: ReviewSetting) -> Result<(), StoreError> {
        self.lock()?.review_settings.push(setting);
        Ok(())
    }

    /// When the account's credential was last stamped as used.
    pub fn credentials_used_at(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()?
            .credentials_used
            .get(&(user_id, marketplace_id))
            .copied())
    }
}

#[async_trait]
impl<P: Pipeline> JobStore<P> for InMemoryStore {
    async fn insert(
        &self,
        job: NewJob<P>,
        rule: DuplicateRule<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        self.lock()?.insert(job, &rule, now)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord<P>>, StoreError> {
        self.lock()?.get::<P>(id)
    }

    async fn claim(
        &self,
        policy: &ClaimPolicy<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        let mut state = self.lock()?;

        let mut candidate: Option<JobRecord<P>> = None;
        for job in state.rows::<P>()? {
            let last_activity = P::ACTIVITY.and_then(|s| state.last_activity(s, job.id));
            if !policy.admits(&job, last_activity, now) {
                continue;
            }
            let better = candidate
                .as_ref()
                .is_none_or(|best| policy.order_key(&job) < policy.order_key(best));
            if better {
                candidate = Some(job);
            }
        }

        let Some(mut job) = candidate else {
            return Ok(None);
        };
        policy.apply(&mut job, now);
        state.put(&job)?;
        Ok(Some(job))
    }

    async fn save(&self, job: &JobRecord<P>) -> Result<(), StoreError> {
        self.lock()?.put(job)
    }

    async fn latest(
        &self,
        scope: JobScope,
        statuses: &[P::Status],
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        Ok(self
            .lock()?
            .rows::<P>()?
            .into_iter()
            .rev()
            .find(|job| {
                scope.admits(job.user_id, job.marketplace_id)
                    && (statuses.is_empty() || statuses.contains(&job.status))
            }))
    }

    async fn list(
        &self,
        scope: JobScope,
        statuses: &[P::Status],
        limit: usize,
    ) -> Result<Vec<JobRecord<P>>, StoreError> {
        Ok(self
            .lock()?
            .rows::<P>()?
            .into_iter()
            .filter(|job| {
                scope.admits(job.user_id, job.marketplace_id)
                    && (statuses.is_empty() || statuses.contains(&job.status))
            })
            .take(limit)
            .collect())
    }

    async fn counts(&self, scope: JobScope) -> Result<StatusCounts, StoreError> {
        let state = self.lock()?;
        let mut counts = StatusCounts::default();
        for job in state.rows::<P>()? {
            if scope.admits(job.user_id, job.marketplace_id) {
                counts.add(job.status.as_str(), 1);
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ActivityLog for InMemoryStore {
    async fn append(
        &self,
        stream: ActivityStream,
        job_id: JobId,
        step: &str,
        payload: JsonValue,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let id = state.next_id();
        state.activity.entry(stream).or_default().push(ActivityEntry {
            id,
            job_id,
            step: step.to_string(),
            payload,
            created_at: at,
        });
        Ok(())
    }

    async fn last_activity_at(
        &self,
        stream: ActivityStream,
        job_id: JobId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock()?.last_activity(stream, job_id))
    }

    async fn latest_step(
        &self,
        stream: ActivityStream,
        job_id: JobId,
        step: &str,
    ) -> Result<Option<ActivityEntry>, StoreError> {
        Ok(self.lock()?.activity.get(&stream).and_then(|entries| {
            entries
                .iter()
                .rev()
                .find(|e| e.job_id == job_id && e.step == step)
                .cloned()
        }))
    }

    async fn history(
        &self,
        stream: ActivityStream,
        job_id: JobId,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        Ok(self
            .lock()?
            .activity
            .get(&stream)
            .map(|entries| entries.iter().filter(|e| e.job_id == job_id).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CredentialProvider for InMemoryStore {
    async fn active_credentials(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<CredentialBundle>, StoreError> {
        Ok(self
            .lock()?
            .credentials
            .get(&(user_id, marketplace_id))
            .cloned())
    }

    async fn mark_used(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock()?
            .credentials_used
            .insert((user_id, marketplace_id), at);
        Ok(())
    }
}

#[async_trait]
impl MarketplaceDirectory for InMemoryStore {
    async fn marketplace(
        &self,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<MarketplaceInfo>, StoreError> {
        Ok(self.lock()?.marketplaces.get(&marketplace_id).cloned())
    }
}

#[async_trait]
impl CommerceRepository for InMemoryStore {
    async fn asin(&self, id: AsinId) -> Result<Option<AsinRecord>, StoreError> {
        Ok(self.lock()?.asins.get(&id.get()).cloned())
    }

    async fn find_asin(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<Option<AsinRecord>, StoreError> {
        Ok(self
            .lock()?
            .asins
            .values()
            .find(|a| a.user_id == user_id && a.marketplace_id == marketplace_id && a.asin == asin)
            .cloned())
    }

    async fn ensure_asin(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<AsinRecord, StoreError> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .asins
            .values()
            .find(|a| a.user_id == user_id && a.marketplace_id == marketplace_id && a.asin == asin)
        {
            return Ok(existing.clone());
        }
        let record = AsinRecord {
            id: AsinId::new(state.next_id()),
            user_id,
            marketplace_id,
            asin: asin.to_string(),
            image: None,
        };
        state.asins.insert(record.id.get(), record.clone());
        Ok(record)
    }

    async fn asins_without_snapshot(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        limit: usize,
    ) -> Result<Vec<AsinRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .asins
            .values()
            .filter(|a| a.user_id == user_id && a.marketplace_id == marketplace_id)
            .filter(|a| {
                !state
                    .snapshots
                    .contains_key(&(user_id, marketplace_id, a.asin.clone()))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn listing_snapshot(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<Option<ListingSnapshot>, StoreError> {
        Ok(self
            .lock()?
            .snapshots
            .get(&(user_id, marketplace_id, asin.to_string()))
            .cloned())
    }

    async fn upsert_orders(
        &self,
        orders: &[OrderRecord],
        _now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        for order in orders {
            let key = (order.user_id, order.marketplace_id, order.order_id.clone());
            let items_imported = state.orders.get(&key).is_some_and(|o| o.items_imported);
            state.orders.insert(
                key,
                OrderRecord {
                    items_imported,
                    ..order.clone()
                },
            );
        }
        Ok(orders.len() as u64)
    }

    async fn order(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self
            .lock()?
            .orders
            .get(&(user_id, marketplace_id, order_id.to_string()))
            .cloned())
    }

    async fn shipped_orders_awaiting_items(
        &self,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let state = self.lock()?;
        let mut orders: Vec<OrderRecord> = state
            .orders
            .values()
            .filter(|o| o.is_shipped() && !o.items_imported)
            .filter(|o| !state.has_job::<OrderItemsSync>(o.user_id, o.marketplace_id, &o.order_id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.purchase_date.cmp(&b.purchase_date));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn record_order_items(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
        items: &[OrderItem],
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let key = (user_id, marketplace_id, order_id.to_string());
        if let Some(order) = state.orders.get_mut(&key) {
            order.items_imported = true;
        }
        state.order_items.insert(key, items.to_vec());
        Ok(())
    }

    async fn order_items(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
    ) -> Result<Vec<OrderItem>, StoreError> {
        Ok(self
            .lock()?
            .order_items
            .get(&(user_id, marketplace_id, order_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn review_candidates(&self, limit: usize) -> Result<Vec<ReviewCandidate>, StoreError> {
        let state = self.lock()?;
        let mut candidates = Vec::new();

        for (key, order) in &state.orders {
            if !order.is_shipped() {
                continue;
            }
            let Some(items) = state.order_items.get(key) else {
                continue;
            };
            let mut seen = HashSet::new();
            for item in items {
                if !seen.insert(item.asin.as_str()) {
                    continue;
                }
                let Some(setting) = state.review_settings.iter().find(|s| {
                    s.enabled
                        && s.user_id == order.user_id
                        && s.marketplace_id == order.marketplace_id
                        && s.asin == item.asin
                }) else {
                    continue;
                };
                let natural_key = format!("{}:{}", order.order_id, item.asin);
                if state.has_job::<ReviewRequest>(order.user_id, order.marketplace_id, &natural_key) {
                    continue;
                }
                candidates.push(ReviewCandidate {
                    user_id: order.user_id,
                    marketplace_id: order.marketplace_id,
                    order_id: order.order_id.clone(),
                    asin: item.asin.clone(),
                    purchase_date: order.purchase_date,
                    delay_days: setting.delay_days,
                    processing_hour: setting.processing_hour,
                });
            }
        }

        candidates.sort_by(|a, b| a.purchase_date.cmp(&b.purchase_date));
        candidates.truncate(limit);
        Ok(candidates)
    }
}

#[async_trait]
impl ListingStore for InMemoryStore {
    async fn open_phase(
        &self,
        phase: ListingPhase,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let waiting_stage = match phase {
            ListingPhase::Request => ListingStage::Pending,
            ListingPhase::Import => ListingStage::Import,
        };
        let parents: Vec<JobRecord<ListingSync>> = state
            .rows::<ListingSync>()?
            .into_iter()
            .filter(|p| p.status == ListingSyncStatus::Pending && p.details.stage == waiting_stage)
            .take(limit)
            .collect();

        let mut created = 0;
        for mut parent in parents {
            let key = parent.id.to_string();
            let inserted = match phase {
                ListingPhase::Request => state
                    .insert(
                        NewJob::<ListingRequest>::new(
                            parent.user_id,
                            parent.marketplace_id,
                            key,
                            ListingPhaseStatus::Pending,
                            ListingRequestDetails {
                                parent_id: parent.id,
                                response: None,
                            },
                        ),
                        &DuplicateRule::AnyStatus,
                        now,
                    )?
                    .is_some(),
                ListingPhase::Import => {
                    let request = state.rows::<ListingRequest>()?.into_iter().find(|r| {
                        r.details.parent_id == parent.id && r.status == ListingPhaseStatus::Completed
                    });
                    let Some(request) = request else {
                        parent.fail(ListingSyncStatus::Error, "no completed request row", now);
                        state.put(&parent)?;
                        continue;
                    };
                    state
                        .insert(
                            NewJob::<ListingImport>::new(
                                parent.user_id,
                                parent.marketplace_id,
                                key,
                                ListingPhaseStatus::Pending,
                                ListingImportDetails {
                                    parent_id: parent.id,
                                    request_id: request.id,
                                },
                            ),
                            &DuplicateRule::AnyStatus,
                            now,
                        )?
                        .is_some()
                }
            };
            if inserted {
                created += 1;
            }

            if phase == ListingPhase::Request {
                parent.details.stage = ListingStage::Request;
            }
            parent.started_at.get_or_insert(now);
            parent.transition(ListingSyncStatus::Processing, now);
            state.put(&parent)?;
        }
        Ok(created)
    }

    async fn complete_request(
        &self,
        request: &JobRecord<ListingRequest>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let parent_id = request.details.parent_id;
        let mut parent = state
            .get::<ListingSync>(parent_id)?
            .ok_or(StoreError::NotFound {
                table: ListingSync::TABLE,
                id: parent_id,
            })?;

        let mut request = request.clone();
        request.complete(ListingPhaseStatus::Completed, now);
        state.put(&request)?;

        parent.details.stage = ListingStage::Import;
        parent.transition(ListingSyncStatus::Pending, now);
        state.put(&parent)
    }

    async fn import_inputs(
        &self,
        import: &JobRecord<ListingImport>,
    ) -> Result<Option<(JobRecord<ListingSync>, JobRecord<ListingRequest>)>, StoreError> {
        let state = self.lock()?;
        let parent = state.get::<ListingSync>(import.details.parent_id)?;
        let request = state
            .get::<ListingRequest>(import.details.request_id)?
            .filter(|r| r.status == ListingPhaseStatus::Completed);
        Ok(parent.zip(request))
    }

    async fn finish_import(
        &self,
        import: &JobRecord<ListingImport>,
        asin_id: AsinId,
        snapshot: &ListingSnapshot,
        image: Option<&ListingImage>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let parent_id = import.details.parent_id;
        let mut parent = state
            .get::<ListingSync>(parent_id)?
            .ok_or(StoreError::NotFound {
                table: ListingSync::TABLE,
                id: parent_id,
            })?;

        state.snapshots.insert(
            (snapshot.user_id, snapshot.marketplace_id, snapshot.asin.clone()),
            snapshot.clone(),
        );
        if let (Some(image), Some(asin)) = (image, state.asins.get_mut(&asin_id.get())) {
            asin.image = Some(image.clone());
        }

        let mut import = import.clone();
        import.complete(ListingPhaseStatus::Completed, now);
        state.put(&import)?;

        parent.details.stage = ListingStage::Completed;
        parent.complete(ListingSyncStatus::Completed, now);
        state.put(&parent)
    }

    async fn fail_import(
        &self,
        import: &JobRecord<ListingImport>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let mut import = import.clone();
        import.fail(ListingPhaseStatus::Error, error, now);
        state.put(&import)?;

        if let Some(mut parent) = state.get::<ListingSync>(import.details.parent_id)? {
            parent.fail(ListingSyncStatus::Error, error, now);
            state.put(&parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use marketsync_core::{CatalogSyncStatus, OrderSyncStatus, ReviewRequestStatus};

    use crate::jobs::{
        CatalogSync, CatalogSyncDetails, ClaimMark, ClaimOrder, ListingSyncDetails, OrderSync,
        OrderSyncDetails, ReviewRequestDetails,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
    }

    fn catalog_claim() -> ClaimPolicy<CatalogSyncStatus> {
        ClaimPolicy::new([CatalogSyncStatus::Pending], |s| match s {
            CatalogSyncStatus::Pending => ClaimMark::attempt(CatalogSyncStatus::WorkerStarted),
            other => ClaimMark::resume(other),
        })
    }

    async fn seed_catalog(store: &InMemoryStore, user: UserId, mp: MarketplaceId) -> JobRecord<CatalogSync> {
        JobStore::<CatalogSync>::insert(
            store,
            NewJob::new(user, mp, "catalog", CatalogSyncStatus::Pending, CatalogSyncDetails::default()),
            DuplicateRule::AnyStatus,
            t0(),
        )
        .await
        .unwrap()
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_yield_exactly_one_claimant() {
        let store = Arc::new(InMemoryStore::new());
        seed_catalog(&store, UserId::new(), MarketplaceId::new()).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                JobStore::<CatalogSync>::claim(&*store, &catalog_claim(), t0())
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn claim_picks_oldest_and_marks_durably() {
        let store = InMemoryStore::new();
        let (user, mp) = (UserId::new(), MarketplaceId::new());
        let first = seed_catalog(&store, user, mp).await;
        seed_catalog(&store, UserId::new(), mp).await;

        let claimed = JobStore::<CatalogSync>::claim(&store, &catalog_claim(), t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.attempts, 1);

        let stored = JobStore::<CatalogSync>::get(&store, first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CatalogSyncStatus::WorkerStarted);
    }

    #[tokio::test]
    async fn run_after_ordering_and_due_check() {
        let store = InMemoryStore::new();
        let (user, mp) = (UserId::new(), MarketplaceId::new());
        let details = |h| ReviewRequestDetails {
            order_id: format!("o-{h}"),
            asin: "B0".into(),
            requested_at: None,
        };
        for (key, hours) in [("late", 5), ("early", 1), ("future", 48)] {
            JobStore::<ReviewRequest>::insert(
                &store,
                NewJob::new(user, mp, key, ReviewRequestStatus::Pending, details(hours))
                    .run_after(t0() + Duration::hours(hours)),
                DuplicateRule::AnyStatus,
                t0(),
            )
            .await
            .unwrap();
        }
        let policy = ClaimPolicy::new([ReviewRequestStatus::Pending], |_| {
            ClaimMark::attempt(ReviewRequestStatus::Processing)
        })
        .ordered_by(ClaimOrder::RunAfter);
        let now = t0() + Duration::hours(6);

        let a = JobStore::<ReviewRequest>::claim(&store, &policy, now).await.unwrap().unwrap();
        let b = JobStore::<ReviewRequest>::claim(&store, &policy, now).await.unwrap().unwrap();
        let c = JobStore::<ReviewRequest>::claim(&store, &policy, now).await.unwrap();

        assert_eq!(a.natural_key, "early");
        assert_eq!(b.natural_key, "late");
        assert!(c.is_none());
    }

    #[tokio::test]
    async fn duplicate_rule_controls_inserts() {
        let store = InMemoryStore::new();
        let (user, mp) = (UserId::new(), MarketplaceId::new());
        let job = || {
            NewJob::<OrderSync>::new(
                user,
                mp,
                "orders",
                OrderSyncStatus::Pending,
                OrderSyncDetails {
                    from: t0() - Duration::days(14),
                    to: t0(),
                    forced: false,
                    imported: None,
                },
            )
        };
        let active = DuplicateRule::AmongStatuses(vec![OrderSyncStatus::Pending, OrderSyncStatus::Running]);

        let first = store.insert(job(), active.clone(), t0()).await.unwrap().unwrap();
        assert!(store.insert(job(), active.clone(), t0()).await.unwrap().is_none());

        let mut done = first;
        done.complete(OrderSyncStatus::Completed, t0());
        store.save(&done).await.unwrap();
        assert!(store.insert(job(), active, t0()).await.unwrap().is_some());

        let counts = JobStore::<OrderSync>::counts(&store, JobScope::All).await.unwrap();
        assert_eq!(counts.get(OrderSyncStatus::Completed), 1);
        assert_eq!(counts.get(OrderSyncStatus::Pending), 1);
    }

    #[tokio::test]
    async fn activity_feeds_cooldown() {
        let store = InMemoryStore::new();
        let job = seed_catalog(&store, UserId::new(), MarketplaceId::new()).await;
        let policy = catalog_claim().cooldown(Duration::seconds(60));

        store
            .append(ActivityStream::CatalogSync, job.id, "started", JsonValue::Null, t0() + Duration::seconds(90))
            .await
            .unwrap();

        let early = JobStore::<CatalogSync>::claim(&store, &policy, t0() + Duration::seconds(120)).await.unwrap();
        assert!(early.is_none());
        let later = JobStore::<CatalogSync>::claim(&store, &policy, t0() + Duration::seconds(151)).await.unwrap();
        assert!(later.is_some());

        let last = store.last_activity_at(ActivityStream::CatalogSync, job.id).await.unwrap();
        assert_eq!(last, Some(t0() + Duration::seconds(90)));
    }

    #[tokio::test]
    async fn upsert_keeps_items_imported_flag() {
        let store = InMemoryStore::new();
        let (user, mp) = (UserId::new(), MarketplaceId::new());
        let order = OrderRecord {
            user_id: user,
            marketplace_id: mp,
            order_id: "111-1".into(),
            order_status: "Shipped".into(),
            purchase_date: t0(),
            last_update_date: None,
            items_imported: false,
            payload: JsonValue::Null,
        };
        store.upsert_orders(&[order.clone()], t0()).await.unwrap();
        assert_eq!(store.shipped_orders_awaiting_items(10).await.unwrap().len(), 1);

        store
            .record_order_items(user, mp, "111-1", &[], t0())
            .await
            .unwrap();
        store.upsert_orders(&[order], t0()).await.unwrap();

        let stored = store.order(user, mp, "111-1").await.unwrap().unwrap();
        assert!(stored.items_imported);
        assert!(store.shipped_orders_awaiting_items(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_phases_hand_over_parent() {
        let store = InMemoryStore::new();
        let (user, mp) = (UserId::new(), MarketplaceId::new());
        let asin = store.ensure_asin(user, mp, "B00TEST").await.unwrap();
        let parent = JobStore::<ListingSync>::insert(
            &store,
            NewJob::new(
                user,
                mp,
                asin.id.to_string(),
                ListingSyncStatus::Pending,
                ListingSyncDetails {
                    asin_id: asin.id,
                    stage: ListingStage::Pending,
                },
            ),
            DuplicateRule::AnyStatus,
            t0(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(store.open_phase(ListingPhase::Request, 10, t0()).await.unwrap(), 1);
        assert_eq!(store.open_phase(ListingPhase::Request, 10, t0()).await.unwrap(), 0);

        let requests = JobStore::<ListingRequest>::list(&store, JobScope::All, &[], 10).await.unwrap();
        store.complete_request(&requests[0], t0()).await.unwrap();

        let parent_now = JobStore::<ListingSync>::get(&store, parent.id).await.unwrap().unwrap();
        assert_eq!(parent_now.status, ListingSyncStatus::Pending);
        assert_eq!(parent_now.details.stage, ListingStage::Import);

        assert_eq!(store.open_phase(ListingPhase::Import, 10, t0()).await.unwrap(), 1);
        let imports = JobStore::<ListingImport>::list(&store, JobScope::All, &[], 10).await.unwrap();
        let (p, r) = store.import_inputs(&imports[0]).await.unwrap().unwrap();
        assert_eq!(p.id, parent.id);
        assert_eq!(r.id, requests[0].id);

        store.fail_import(&imports[0], "bad payload", t0()).await.unwrap();
        let parent_now = JobStore::<ListingSync>::get(&store, parent.id).await.unwrap().unwrap();
        assert_eq!(parent_now.status, ListingSyncStatus::Error);
        assert_eq!(parent_now.last_error.as_deref(), Some("bad payload"));
    }
}
