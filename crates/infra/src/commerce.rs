//! Marketplace data the pipelines read and write: ASINs, listing snapshots,
//! orders and their line items, review settings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketsync_core::{AsinId, MarketplaceId, UserId};

use crate::jobs::{JobRecord, ListingImport, ListingRequest, ListingSync, StoreError};

/// Canonical ASIN row of a seller account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsinRecord {
    pub id: AsinId,
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    pub asin: String,
    pub image: Option<ListingImage>,
}

/// One image entry of a catalog item response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingImage {
    pub variant: String,
    pub link: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Denormalized catalog item, keyed by (user, marketplace, asin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    pub asin: String,
    pub title: Option<String>,
    pub brand: Option<String>,
    pub product_type: Option<String>,
    /// Full catalog item as returned by the adapter.
    pub payload: JsonValue,
    pub synced_at: DateTime<Utc>,
}

/// An order as returned by the order-fetch adapter, keyed by
/// (user, marketplace, external order id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    pub order_id: String,
    pub order_status: String,
    pub purchase_date: DateTime<Utc>,
    pub last_update_date: Option<DateTime<Utc>>,
    /// Set by the order-items pipeline; never overwritten by order upserts.
    pub items_imported: bool,
    pub payload: JsonValue,
}

impl OrderRecord {
    pub fn is_shipped(&self) -> bool {
        self.order_status.eq_ignore_ascii_case("shipped")
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub asin: String,
    #[serde(default)]
    pub seller_sku: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub title: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

/// Per-ASIN review solicitation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSetting {
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    pub asin: String,
    pub enabled: bool,
    pub delay_days: u32,
    /// Hour of day (UTC, 0-23) at which requests for this ASIN go out.
    pub processing_hour: u32,
}

/// A shipped (order, asin) pair with enabled settings and no queued request yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewCandidate {
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    pub order_id: String,
    pub asin: String,
    pub purchase_date: DateTime<Utc>,
    pub delay_days: u32,
    pub processing_hour: u32,
}

#[async_trait]
pub trait CommerceRepository: Send + Sync {
    async fn asin(&self, id: AsinId) -> Result<Option<AsinRecord>, StoreError>;

    async fn find_asin(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<Option<AsinRecord>, StoreError>;

    /// Create the canonical ASIN row or return the existing one.
    async fn ensure_asin(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<AsinRecord, StoreError>;

    /// ASINs of the account that have no listing snapshot yet.
    async fn asins_without_snapshot(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        limit: usize,
    ) -> Result<Vec<AsinRecord>, StoreError>;

    async fn listing_snapshot(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        asin: &str,
    ) -> Result<Option<ListingSnapshot>, StoreError>;

    /// Bulk upsert; returns the number of rows written.
    async fn upsert_orders(
        &self,
        orders: &[OrderRecord],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn order(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError>;

    /// Shipped orders with items not imported and no items-sync row, oldest purchase first.
    async fn shipped_orders_awaiting_items(
        &self,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, StoreError>;

    /// Replace the order's line items and flag it `items_imported`.
    async fn record_order_items(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
        items: &[OrderItem],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn order_items(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        order_id: &str,
    ) -> Result<Vec<OrderItem>, StoreError>;

    /// Shipped order lines joined to enabled review settings, excluding pairs
    /// that already have a review request row.
    async fn review_candidates(&self, limit: usize) -> Result<Vec<ReviewCandidate>, StoreError>;
}

/// Which child phase of a listing sync a dispatch pass opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingPhase {
    Request,
    Import,
}

/// Multi-row transactions of the two-phase listing sync.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Lock up to `limit` parents waiting for `phase`, create the phase row for
    /// each (skipping parents that already have one) and flip the parents to
    /// `processing`. One transaction per call. Returns the number of phase rows created.
    async fn open_phase(
        &self,
        phase: ListingPhase,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Mark the request row completed (with its stored response) and hand the
    /// parent over to the import phase, atomically.
    async fn complete_request(
        &self,
        request: &JobRecord<ListingRequest>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Lock and return the parent and its completed request row.
    async fn import_inputs(
        &self,
        import: &JobRecord<ListingImport>,
    ) -> Result<Option<(JobRecord<ListingSync>, JobRecord<ListingRequest>)>, StoreError>;

    /// Upsert the snapshot, write the ASIN image and complete import + parent,
    /// atomically.
    async fn finish_import(
        &self,
        import: &JobRecord<ListingImport>,
        asin_id: AsinId,
        snapshot: &ListingSnapshot,
        image: Option<&ListingImage>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set both the import row and its parent to `error`.
    async fn fail_import(
        &self,
        import: &JobRecord<ListingImport>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
