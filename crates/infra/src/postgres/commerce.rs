//! Accounts, commerce data and the listing-sync phase transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection};
use tracing::{instrument, warn};
use uuid::Uuid;

use marketsync_core::{
    AsinId, JobId, JobState, ListingPhaseStatus, ListingStage, ListingSyncStatus, MarketplaceId, UserId,
};

use super::jobs::{JOB_COLUMNS, fetch_job, insert_job, update_job};
use super::{PgStore, map_sqlx_error};
use crate::accounts::{CredentialBundle, CredentialProvider, MarketplaceDirectory, MarketplaceInfo};
use crate::commerce::{
    AsinRecord, CommerceRepository, ListingImage, ListingPhase, ListingSnapshot, ListingStore,
    OrderItem, OrderRecord, ReviewCandidate,
};
use crate::jobs::{
    DuplicateRule, JobRecord, JobRow, ListingImport, ListingImportDetails, ListingRequest,
    ListingRequestDetails, ListingSync, NewJob, Pipeline, StoreError,
};

#[derive(Debug, FromRow)]
struct CredentialRow {
    refresh_token: String,
    client_id: String,
    client_secret: String,
    access_key_id: String,
    secret_access_key: String,
    role_arn: String,
    region: String,
}

impl From<CredentialRow> for CredentialBundle {
    fn from(row: CredentialRow) -> Self {
        Self {
            refresh_token: row.refresh_token,
            client_id: row.client_id,
            client_secret: row.client_secret,
            access_key_id: row.access_key_id,
            secret_access_key: row.secret_access_key,
            role_arn: row.role_arn,
            region: row.region,
        }
    }
}

#[async_trait]
impl CredentialProvider for PgStore {
    #[instrument(skip(self), err)]
    async fn active_credentials(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<CredentialBundle>, StoreError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT refresh_token, client_id, client_secret, access_key_id,
                   secret_access_key, role_arn, region
            FROM marketplace_credentials
            WHERE user_id = $1 AND marketplace_id = $2 AND is_active
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_credentials", e))?;
        Ok(row.map(Into::into))
    }

    async fn mark_used(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE marketplace_credentials SET last_used_at = $3 \
             WHERE user_id = $1 AND marketplace_id = $2 AND is_active",
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_credentials_used", e))?;
        Ok(())
    }
}

#[async_trait]
impl MarketplaceDirectory for PgStore {
    async fn marketplace(
        &self,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<MarketplaceInfo>, StoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT external_id, country_code FROM marketplaces WHERE id = $1")
                .bind(marketplace_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("marketplace", e))?;
        Ok(row.map(|(external_id, country_code)| MarketplaceInfo {
            id: marketplace_id,
            external_id,
            country_code,
        }))
    }
}

#[derive(Debug, FromRow)]
struct AsinRow {
    id: i64,
    user_id: Uuid,
    marketplace_id: Uuid,
    asin: String,
    image: Option<JsonValue>,
}

impl AsinRow {
    fn into_record(self) -> AsinRecord {
        // A malformed stored image only loses the image, never the ASIN.
        let image = self
            .image
            .and_then(|v| match serde_json::from_value::<ListingImage>(v) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!(asin_id = self.id, error = %e, "ignoring malformed stored image");
                    None
                }
            });
        AsinRecord {
            id: AsinId::new(self.id),
            user_id: UserId::from_uuid(self.user_id),
            marketplace_id: MarketplaceId::from_uuid(self.marketplace_id),
            asin: self.asin,
            image,
        }
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    user_id: Uuid,
    marketplace_id: Uuid,
    order_id: String,
    order_status: String,
    purchase_date: DateTime<Utc>,
    last_update_date: Option<DateTime<Utc>>,
    items_imported: bool,
    payload: JsonValue,
}

impl From<OrderRow> for OrderRecord {
    fn from(row: OrderRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            marketplace_id: MarketplaceId::from_uuid(row.marketplace_id),
            order_id: row.order_id,
            order_status: row.order_status,
            purchase_date: row.purchase_date,
            last_update_date: row.last_update_date,
            items_imported: row.items_imported,
            payload: row.payload,
        }
    }
}

const ORDER_COLUMNS: &str = "user_id, marketplace_id, order_id, order_status, purchase_date, \
     last_update_date, items_imported, payload";

#[derive(Debug, FromRow)]
struct SnapshotRow {
    user_id: Uuid,
    marketplace_id: Uuid,
    asin: String,
    title: Option<String>,
    brand: Option<String>,
    product_type: Option<String>,
    payload: JsonValue,
    synced_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct CandidateRow {
    user_id: Uuid,
    marketplace_id: Uuid,
    order_id: String,
    asin: String,
    purchase_date: DateTime<Utc>,
    delay_days: i32,
    processing_hour: i32,
}

#[async_trait]
impl CommerceRepository for PgStore {
    async fn asin(&self, id: AsinId) -> Result<Option<AsinRecord>, StoreError> {
        let row = sqlx::query_as::<_, AsinRow>(
            "SELECT id, user_id, marketplace_id, asin, image FROM asins WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("asin", e))?;
        Ok(row.map(AsinRow::into_record))
    }

    async fn find_asin(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<Option<AsinRecord>, StoreError> {
        let row = sqlx::query_as::<_, AsinRow>(
            "SELECT id, user_id, marketplace_id, asin, image FROM asins \
             WHERE user_id = $1 AND marketplace_id = $2 AND asin = $3",
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(asin)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_asin", e))?;
        Ok(row.map(AsinRow::into_record))
    }

    #[instrument(skip(self), err)]
    async fn ensure_asin(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<AsinRecord, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, AsinRow>(
            r#"
            INSERT INTO asins (user_id, marketplace_id, asin)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, marketplace_id, asin) DO UPDATE SET asin = EXCLUDED.asin
            RETURNING id, user_id, marketplace_id, asin, image
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(asin)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_asin", e))?;
        Ok(row.into_record())
    }

    async fn asins_without_snapshot(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        limit: usize,
    ) -> Result<Vec<AsinRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AsinRow>(
            r#"
            SELECT a.id, a.user_id, a.marketplace_id, a.asin, a.image
            FROM asins a
            WHERE a.user_id = $1 AND a.marketplace_id = $2
              AND NOT EXISTS (
                SELECT 1 FROM listing_snapshots s
                WHERE s.user_id = a.user_id AND s.marketplace_id = a.marketplace_id
                  AND s.asin = a.asin
              )
            ORDER BY a.id
            LIMIT $3
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("asins_without_snapshot", e))?;
        Ok(rows.into_iter().map(AsinRow::into_record).collect())
    }

    async fn listing_snapshot(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<Option<ListingSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT user_id, marketplace_id, asin, title, brand, product_type, payload, synced_at
            FROM listing_snapshots
            WHERE user_id = $1 AND marketplace_id = $2 AND asin = $3
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(asin)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("listing_snapshot", e))?;
        Ok(row.map(|r| ListingSnapshot {
            user_id: UserId::from_uuid(r.user_id),
            marketplace_id: MarketplaceId::from_uuid(r.marketplace_id),
            asin: r.asin,
            title: r.title,
            brand: r.brand,
            product_type: r.product_type,
            payload: r.payload,
            synced_at: r.synced_at,
        }))
    }

    #[instrument(skip(self, orders), fields(count = orders.len()), err)]
    async fn upsert_orders(
        &self,
        orders: &[OrderRecord],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut written = 0;
        for order in orders {
            let result = sqlx::query(
                r#"
                INSERT INTO orders (user_id, marketplace_id, order_id, order_status, purchase_date,
                                    last_update_date, payload, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                ON CONFLICT (user_id, marketplace_id, order_id) DO UPDATE SET
                    order_status = EXCLUDED.order_status,
                    purchase_date = EXCLUDED.purchase_date,
                    last_update_date = EXCLUDED.last_update_date,
                    payload = EXCLUDED.payload,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(order.user_id.as_uuid())
            .bind(order.marketplace_id.as_uuid())
            .bind(&order.order_id)
            .bind(&order.order_status)
            .bind(order.purchase_date)
            .bind(order.last_update_date)
            .bind(&order.payload)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_order", e))?;
            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(written)
    }

    async fn order(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 AND marketplace_id = $2 AND order_id = $3"
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(user_id.as_uuid())
            .bind(marketplace_id.as_uuid())
            .bind(order_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("order", e))?;
        Ok(row.map(Into::into))
    }

    async fn shipped_orders_awaiting_items(
        &self,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o
             WHERE lower(o.order_status) = 'shipped'
               AND NOT o.items_imported
               AND NOT EXISTS (
                 SELECT 1 FROM order_items_sync_jobs j
                 WHERE j.user_id = o.user_id AND j.marketplace_id = o.marketplace_id
                   AND j.natural_key = o.order_id
               )
             ORDER BY o.purchase_date
             LIMIT $1"
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("shipped_orders_awaiting_items", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, items), fields(count = items.len()), err)]
    async fn record_order_items(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
        items: &[OrderItem],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            "DELETE FROM order_items WHERE user_id = $1 AND marketplace_id = $2 AND order_id = $3",
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("clear_order_items", e))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO order_items (user_id, marketplace_id, order_id, asin, seller_sku,
                                         quantity, title, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(user_id.as_uuid())
            .bind(marketplace_id.as_uuid())
            .bind(order_id)
            .bind(&item.asin)
            .bind(&item.seller_sku)
            .bind(i32::try_from(item.quantity).unwrap_or(i32::MAX))
            .bind(&item.title)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }

        sqlx::query(
            "UPDATE orders SET items_imported = TRUE, updated_at = $4 \
             WHERE user_id = $1 AND marketplace_id = $2 AND order_id = $3",
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(order_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("flag_items_imported", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn order_items(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
    ) -> Result<Vec<OrderItem>, StoreError> {
        let rows: Vec<(String, Option<String>, i32, Option<String>)> = sqlx::query_as(
            "SELECT asin, seller_sku, quantity, title FROM order_items \
             WHERE user_id = $1 AND marketplace_id = $2 AND order_id = $3 ORDER BY id",
        )
        .bind(user_id.as_uuid())
        .bind(marketplace_id.as_uuid())
        .bind(order_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("order_items", e))?;
        Ok(rows
            .into_iter()
            .map(|(asin, seller_sku, quantity, title)| OrderItem {
                asin,
                seller_sku,
                quantity: u32::try_from(quantity).unwrap_or_default(),
                title,
            })
            .collect())
    }

    async fn review_candidates(&self, limit: usize) -> Result<Vec<ReviewCandidate>, StoreError> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (o.user_id, o.marketplace_id, o.order_id, i.asin)
                       o.user_id, o.marketplace_id, o.order_id, i.asin, o.purchase_date,
                       s.delay_days, s.processing_hour
                FROM orders o
                JOIN order_items i
                  ON i.user_id = o.user_id AND i.marketplace_id = o.marketplace_id
                 AND i.order_id = o.order_id
                JOIN review_settings s
                  ON s.user_id = o.user_id AND s.marketplace_id = o.marketplace_id
                 AND s.asin = i.asin AND s.enabled
                WHERE lower(o.order_status) = 'shipped'
                  AND NOT EXISTS (
                    SELECT 1 FROM review_requests r
                    WHERE r.user_id = o.user_id AND r.marketplace_id = o.marketplace_id
                      AND r.natural_key = o.order_id || ':' || i.asin
                  )
                ORDER BY o.user_id, o.marketplace_id, o.order_id, i.asin
            ) c
            ORDER BY c.purchase_date
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("review_candidates", e))?;

        Ok(rows
            .into_iter()
            .map(|r| ReviewCandidate {
                user_id: UserId::from_uuid(r.user_id),
                marketplace_id: MarketplaceId::from_uuid(r.marketplace_id),
                order_id: r.order_id,
                asin: r.asin,
                purchase_date: r.purchase_date,
                delay_days: u32::try_from(r.delay_days).unwrap_or_default(),
                processing_hour: u32::try_from(r.processing_hour).unwrap_or_default(),
            })
            .collect())
    }
}

async fn lock_parent(
    conn: &mut PgConnection,
    parent_id: JobId,
) -> Result<JobRecord<ListingSync>, StoreError> {
    fetch_job::<ListingSync>(conn, parent_id, true)
        .await?
        .ok_or(StoreError::NotFound {
            table: ListingSync::TABLE,
            id: parent_id,
        })
}

async fn completed_request(
    conn: &mut PgConnection,
    parent: &JobRecord<ListingSync>,
) -> Result<Option<JobRecord<ListingRequest>>, StoreError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM {} \
         WHERE user_id = $1 AND marketplace_id = $2 AND natural_key = $3 AND status = 'completed' \
         ORDER BY id DESC LIMIT 1",
        ListingRequest::TABLE
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(parent.user_id.as_uuid())
        .bind(parent.marketplace_id.as_uuid())
        .bind(parent.id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("completed_request", e))?
        .map(JobRow::decode::<ListingRequest>)
        .transpose()
}

#[async_trait]
impl ListingStore for PgStore {
    #[instrument(skip(self), err)]
    async fn open_phase(
        &self,
        phase: ListingPhase,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let waiting_stage = match phase {
            ListingPhase::Request => ListingStage::Pending,
            ListingPhase::Import => ListingStage::Import,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} \
             WHERE status = 'pending' AND details->>'stage' = $1 \
             ORDER BY id LIMIT $2 FOR UPDATE SKIP LOCKED",
            ListingSync::TABLE
        );
        let parents = sqlx::query_as::<_, JobRow>(&sql)
            .bind(waiting_stage.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_listing_parents", e))?;

        let mut created = 0;
        for row in parents {
            let mut parent = row.decode::<ListingSync>()?;
            let key = parent.id.to_string();
            let inserted = match phase {
                ListingPhase::Request => insert_job(
                    &mut tx,
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
                )
                .await?
                .is_some(),
                ListingPhase::Import => {
                    let Some(request) = completed_request(&mut tx, &parent).await? else {
                        parent.fail(ListingSyncStatus::Error, "no completed request row", now);
                        update_job(&mut tx, &parent).await?;
                        continue;
                    };
                    insert_job(
                        &mut tx,
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
                    )
                    .await?
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
            update_job(&mut tx, &parent).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(created)
    }

    #[instrument(skip_all, fields(request_id = %request.id), err)]
    async fn complete_request(
        &self,
        request: &JobRecord<ListingRequest>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut parent = lock_parent(&mut tx, request.details.parent_id).await?;

        let mut request = request.clone();
        request.complete(ListingPhaseStatus::Completed, now);
        update_job(&mut tx, &request).await?;

        parent.details.stage = ListingStage::Import;
        parent.transition(ListingSyncStatus::Pending, now);
        update_job(&mut tx, &parent).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn import_inputs(
        &self,
        import: &JobRecord<ListingImport>,
    ) -> Result<Option<(JobRecord<ListingSync>, JobRecord<ListingRequest>)>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let parent = fetch_job::<ListingSync>(&mut tx, import.details.parent_id, true).await?;
        let request = fetch_job::<ListingRequest>(&mut tx, import.details.request_id, true)
            .await?
            .filter(|r| r.status == ListingPhaseStatus::Completed);

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(parent.zip(request))
    }

    #[instrument(skip_all, fields(import_id = %import.id, asin = %snapshot.asin), err)]
    async fn finish_import(
        &self,
        import: &JobRecord<ListingImport>,
        asin_id: AsinId,
        snapshot: &ListingSnapshot,
        image: Option<&ListingImage>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut parent = lock_parent(&mut tx, import.details.parent_id).await?;

        sqlx::query(
            r#"
            INSERT INTO listing_snapshots (user_id, marketplace_id, asin, title, brand,
                                           product_type, payload, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, marketplace_id, asin) DO UPDATE SET
                title = EXCLUDED.title,
                brand = EXCLUDED.brand,
                product_type = EXCLUDED.product_type,
                payload = EXCLUDED.payload,
                synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(snapshot.user_id.as_uuid())
        .bind(snapshot.marketplace_id.as_uuid())
        .bind(&snapshot.asin)
        .bind(&snapshot.title)
        .bind(&snapshot.brand)
        .bind(&snapshot.product_type)
        .bind(&snapshot.payload)
        .bind(snapshot.synced_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_snapshot", e))?;

        if let Some(image) = image {
            let image = serde_json::to_value(image)
                .map_err(|e| StoreError::Decode(format!("listing image: {e}")))?;
            sqlx::query("UPDATE asins SET image = $2 WHERE id = $1")
                .bind(asin_id.get())
                .bind(&image)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_asin_image", e))?;
        }

        let mut import = import.clone();
        import.complete(ListingPhaseStatus::Completed, now);
        update_job(&mut tx, &import).await?;

        parent.details.stage = ListingStage::Completed;
        parent.complete(ListingSyncStatus::Completed, now);
        update_job(&mut tx, &parent).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip_all, fields(import_id = %import.id), err)]
    async fn fail_import(
        &self,
        import: &JobRecord<ListingImport>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut import = import.clone();
        import.fail(ListingPhaseStatus::Error, error, now);
        update_job(&mut tx, &import).await?;

        if let Some(mut parent) = fetch_job::<ListingSync>(&mut tx, import.details.parent_id, true).await? {
            parent.fail(ListingSyncStatus::Error, error, now);
            update_job(&mut tx, &parent).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}
