//! The concrete queue tables.
//!
//! Each marker type binds a table name to its status enum and the
//! pipeline-specific columns stored alongside the common job columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketsync_core::{
    AsinId, CatalogSyncStatus, IdentifierStatus, JobId, ListingPhaseStatus, ListingStage,
    ListingSyncStatus, OrderItemsStatus, OrderSyncStatus, ReviewRequestStatus,
};

use super::types::Pipeline;
use crate::activity::ActivityStream;

/// Multi-step catalog report sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogSync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSyncDetails {
    pub report_type: String,
}

impl Default for CatalogSyncDetails {
    fn default() -> Self {
        Self {
            report_type: "GET_MERCHANT_LISTINGS_ALL_DATA".to_string(),
        }
    }
}

impl Pipeline for CatalogSync {
    type Status = CatalogSyncStatus;
    type Details = CatalogSyncDetails;
    const TABLE: &'static str = "catalog_sync_jobs";
    const ACTIVITY: Option<ActivityStream> = Some(ActivityStream::CatalogSync);
}

/// Parent row of a two-phase listing sync; one per ASIN refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSyncDetails {
    pub asin_id: AsinId,
    /// Currently authoritative phase.
    pub stage: ListingStage,
}

impl Pipeline for ListingSync {
    type Status = ListingSyncStatus;
    type Details = ListingSyncDetails;
    const TABLE: &'static str = "listing_sync_jobs";
}

/// Request phase: fetch the catalog item and keep the raw response.
///
/// The natural key is the parent row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRequestDetails {
    pub parent_id: JobId,
    /// Verbatim adapter response, present once the phase completed.
    #[serde(default)]
    pub response: Option<JsonValue>,
}

impl Pipeline for ListingRequest {
    type Status = ListingPhaseStatus;
    type Details = ListingRequestDetails;
    const TABLE: &'static str = "listing_sync_requests";
}

/// Import phase: denormalize the stored response. No external call.
///
/// The natural key is the parent row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingImport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingImportDetails {
    pub parent_id: JobId,
    pub request_id: JobId,
}

impl Pipeline for ListingImport {
    type Status = ListingPhaseStatus;
    type Details = ListingImportDetails;
    const TABLE: &'static str = "listing_sync_imports";
}

/// Windowed order sync; one active row per (user, marketplace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSyncDetails {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub forced: bool,
    /// Rows upserted by the successful run.
    #[serde(default)]
    pub imported: Option<u64>,
}

impl Pipeline for OrderSync {
    type Status = OrderSyncStatus;
    type Details = OrderSyncDetails;
    const TABLE: &'static str = "order_sync_jobs";
    const ACTIVITY: Option<ActivityStream> = Some(ActivityStream::OrderSync);
}

/// Line items of one shipped order. The natural key is the external order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderItemsSync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemsDetails {
    pub order_id: String,
    #[serde(default)]
    pub item_count: Option<u32>,
}

impl Pipeline for OrderItemsSync {
    type Status = OrderItemsStatus;
    type Details = OrderItemsDetails;
    const TABLE: &'static str = "order_items_sync_jobs";
}

/// A catalog line that carried only a secondary identifier.
///
/// The natural key is `<raw type>:<value>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedIdentifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierDetails {
    /// Type code as it appeared in the report (e.g. `"4"`, `"EAN"`).
    pub raw_type: String,
    pub value: String,
    #[serde(default)]
    pub asin_id: Option<AsinId>,
}

impl Pipeline for UnresolvedIdentifier {
    type Status = IdentifierStatus;
    type Details = IdentifierDetails;
    const TABLE: &'static str = "unresolved_identifiers";
}

/// Scheduled review solicitation; the natural key is `<order id>:<asin>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequestDetails {
    pub order_id: String,
    pub asin: String,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl Pipeline for ReviewRequest {
    type Status = ReviewRequestStatus;
    type Details = ReviewRequestDetails;
    const TABLE: &'static str = "review_requests";
}
