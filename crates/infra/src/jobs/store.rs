//! Job storage abstraction shared by every queue table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use marketsync_core::{DomainError, JobId, JobState, MarketplaceId, UserId};

use super::claim::ClaimPolicy;
use super::types::{DuplicateRule, JobRecord, JobScope, NewJob, Pipeline, StatusCounts};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{table} row not found: {id}")]
    NotFound { table: &'static str, id: JobId },
    #[error("conflict: {0}")]
    Conflict(String),
    /// A persisted value could not be turned back into its typed form.
    #[error("decode error: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Untyped queue row, the shape shared by every queue table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub user_id: Uuid,
    pub marketplace_id: Uuid,
    pub natural_key: String,
    pub status: String,
    pub attempts: i32,
    pub run_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub details: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    /// Parse into a typed record. Unknown statuses or malformed details fail here.
    pub fn decode<P: Pipeline>(self) -> Result<JobRecord<P>, StoreError> {
        let status = self.status.parse::<P::Status>()?;
        let details = serde_json::from_value::<P::Details>(self.details).map_err(|e| {
            StoreError::Decode(format!("{} row {} details: {e}", P::TABLE, self.id))
        })?;

        Ok(JobRecord {
            id: JobId::new(self.id),
            user_id: UserId::from_uuid(self.user_id),
            marketplace_id: MarketplaceId::from_uuid(self.marketplace_id),
            natural_key: self.natural_key,
            status,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            run_after: self.run_after,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error,
            details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    pub fn encode<P: Pipeline>(job: &JobRecord<P>) -> Result<Self, StoreError> {
        Ok(Self {
            id: job.id.get(),
            user_id: *job.user_id.as_uuid(),
            marketplace_id: *job.marketplace_id.as_uuid(),
            natural_key: job.natural_key.clone(),
            status: job.status.as_str().to_string(),
            attempts: i32::try_from(job.attempts).unwrap_or(i32::MAX),
            run_after: job.run_after,
            started_at: job.started_at,
            finished_at: job.finished_at,
            last_error: job.last_error.clone(),
            details: encode_details::<P>(&job.details)?,
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }
}

pub(crate) fn encode_details<P: Pipeline>(details: &P::Details) -> Result<JsonValue, StoreError> {
    serde_json::to_value(details)
        .map_err(|e| StoreError::Decode(format!("{} details: {e}", P::TABLE)))
}

/// Queue persistence for one pipeline table.
#[async_trait]
pub trait JobStore<P: Pipeline>: Send + Sync {
    /// Insert unless a row with the same (user, marketplace, natural key)
    /// already exists under `rule`. Returns `None` for a duplicate.
    async fn insert(
        &self,
        job: NewJob<P>,
        rule: DuplicateRule<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord<P>>, StoreError>;

    /// Claim the oldest row admitted by `policy`.
    ///
    /// The returned row already carries the claim mark, durably committed.
    /// `None` means "no work" (including losing a race for the candidate).
    async fn claim(
        &self,
        policy: &ClaimPolicy<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError>;

    /// Persist the mutable columns of a row.
    async fn save(&self, job: &JobRecord<P>) -> Result<(), StoreError>;

    /// Newest row (by id) in scope whose status is in `statuses` (any status when empty).
    async fn latest(
        &self,
        scope: JobScope,
        statuses: &[P::Status],
    ) -> Result<Option<JobRecord<P>>, StoreError>;

    /// Rows in scope whose status is in `statuses` (any status when empty), oldest first.
    async fn list(
        &self,
        scope: JobScope,
        statuses: &[P::Status],
        limit: usize,
    ) -> Result<Vec<JobRecord<P>>, StoreError>;

    async fn counts(&self, scope: JobScope) -> Result<StatusCounts, StoreError>;
}
