//! Append-only per-job activity streams.
//!
//! The job row's own `updated_at` is not trustworthy while a long external call
//! is in flight, so pipelines that need stale-job detection record every step
//! here and the claim engine reads the newest entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use marketsync_core::JobId;

use crate::jobs::StoreError;

/// Which activity table an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStream {
    CatalogSync,
    OrderSync,
}

impl ActivityStream {
    pub fn table(&self) -> &'static str {
        match self {
            ActivityStream::CatalogSync => "catalog_sync_activity",
            ActivityStream::OrderSync => "order_sync_activity",
        }
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub job_id: JobId,
    pub step: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    /// Append an entry. Entries are never updated.
    async fn append(
        &self,
        stream: ActivityStream,
        job_id: JobId,
        step: &str,
        payload: JsonValue,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Timestamp of the newest entry for the job.
    async fn last_activity_at(
        &self,
        stream: ActivityStream,
        job_id: JobId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Newest entry with the given step code.
    async fn latest_step(
        &self,
        stream: ActivityStream,
        job_id: JobId,
        step: &str,
    ) -> Result<Option<ActivityEntry>, StoreError>;

    /// Full history of a job, oldest first.
    async fn history(
        &self,
        stream: ActivityStream,
        job_id: JobId,
    ) -> Result<Vec<ActivityEntry>, StoreError>;
}
