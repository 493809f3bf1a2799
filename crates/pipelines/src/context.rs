//! Collaborators shared by every pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use marketsync_core::{JobId, MarketplaceId, UserId};
use marketsync_infra::accounts::{
    CredentialBundle, CredentialProvider, MarketplaceDirectory, MarketplaceInfo,
};
use marketsync_infra::activity::ActivityLog;
use marketsync_infra::commerce::{CommerceRepository, ListingStore};
use marketsync_infra::external::{
    Action, ActionError, ActionInvoker, ActionRequest, ActionTimeouts, Envelope,
};
use marketsync_infra::jobs::{
    CatalogSync, JobStore, ListingImport, ListingRequest, ListingSync, OrderItemsSync, OrderSync,
    ReviewRequest, UnresolvedIdentifier,
};

use crate::error::{JobFailure, PipelineResult, StepResult};

/// A storage backend implementing every storage trait.
///
/// Both `InMemoryStore` and `PgStore` qualify.
pub trait Backend:
    JobStore<CatalogSync>
    + JobStore<ListingSync>
    + JobStore<ListingRequest>
    + JobStore<ListingImport>
    + JobStore<OrderSync>
    + JobStore<OrderItemsSync>
    + JobStore<UnresolvedIdentifier>
    + JobStore<ReviewRequest>
    + ActivityLog
    + CredentialProvider
    + MarketplaceDirectory
    + CommerceRepository
    + ListingStore
    + 'static
{
}

impl<T> Backend for T where
    T: JobStore<CatalogSync>
        + JobStore<ListingSync>
        + JobStore<ListingRequest>
        + JobStore<ListingImport>
        + JobStore<OrderSync>
        + JobStore<OrderItemsSync>
        + JobStore<UnresolvedIdentifier>
        + JobStore<ReviewRequest>
        + ActivityLog
        + CredentialProvider
        + MarketplaceDirectory
        + CommerceRepository
        + ListingStore
        + 'static
{
}

/// One typed handle per table.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn JobStore<CatalogSync>>,
    pub listings: Arc<dyn JobStore<ListingSync>>,
    pub listing_requests: Arc<dyn JobStore<ListingRequest>>,
    pub listing_imports: Arc<dyn JobStore<ListingImport>>,
    pub orders: Arc<dyn JobStore<OrderSync>>,
    pub order_items: Arc<dyn JobStore<OrderItemsSync>>,
    pub identifiers: Arc<dyn JobStore<UnresolvedIdentifier>>,
    pub reviews: Arc<dyn JobStore<ReviewRequest>>,
    pub activity: Arc<dyn ActivityLog>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub marketplaces: Arc<dyn MarketplaceDirectory>,
    pub commerce: Arc<dyn CommerceRepository>,
    pub listing_phases: Arc<dyn ListingStore>,
}

impl Stores {
    pub fn from_backend<B: Backend>(backend: Arc<B>) -> Self {
        Self {
            catalog: backend.clone(),
            listings: backend.clone(),
            listing_requests: backend.clone(),
            listing_imports: backend.clone(),
            orders: backend.clone(),
            order_items: backend.clone(),
            identifiers: backend.clone(),
            reviews: backend.clone(),
            activity: backend.clone(),
            credentials: backend.clone(),
            marketplaces: backend.clone(),
            commerce: backend.clone(),
            listing_phases: backend,
        }
    }
}

/// Marketplace mapping and credentials of one seller account.
#[derive(Debug, Clone)]
pub struct AccountAccess {
    pub marketplace: MarketplaceInfo,
    pub credentials: CredentialBundle,
}

impl AccountAccess {
    /// Adapter request carrying the external marketplace id and the credential bundle.
    pub fn request(&self, action: Action, job_id: JobId) -> ActionRequest {
        ActionRequest::new(action, job_id)
            .arg("marketplace_id", &self.marketplace.external_id)
            .arg("country_code", &self.marketplace.country_code)
            .credentials(&self.credentials)
    }
}

/// Outcome of the account lookup that precedes every adapter call.
#[derive(Debug, Clone)]
pub enum Access {
    Granted(AccountAccess),
    /// Local precondition failure, never fixed by retrying soon.
    Missing(&'static str),
}

#[derive(Clone)]
pub struct Context {
    pub stores: Stores,
    pub invoker: Arc<dyn ActionInvoker>,
    pub timeouts: ActionTimeouts,
}

impl Context {
    pub fn new(stores: Stores, invoker: Arc<dyn ActionInvoker>, timeouts: ActionTimeouts) -> Self {
        Self {
            stores,
            invoker,
            timeouts,
        }
    }

    pub async fn account_access(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
    ) -> PipelineResult<Access> {
        let Some(marketplace) = self.stores.marketplaces.marketplace(marketplace_id).await? else {
            return Ok(Access::Missing("no marketplace mapping"));
        };
        let Some(credentials) = self
            .stores
            .credentials
            .active_credentials(user_id, marketplace_id)
            .await?
        else {
            return Ok(Access::Missing("no active credentials"));
        };
        Ok(Access::Granted(AccountAccess {
            marketplace,
            credentials,
        }))
    }

    /// Like [`Self::account_access`], with a missing precondition as the error.
    pub async fn require_access(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
    ) -> StepResult<AccountAccess> {
        match self.account_access(user_id, marketplace_id).await? {
            Access::Granted(access) => Ok(access),
            Access::Missing(reason) => Err(JobFailure::Precondition(reason)),
        }
    }

    /// Run an adapter under its phase timeout and require `success: true`.
    pub async fn run(&self, request: &ActionRequest) -> Result<Envelope, ActionError> {
        self.invoker
            .run(request, self.timeouts.for_action(request.action))
            .await
    }

    /// Run an adapter under its phase timeout, whatever its `success` flag.
    pub async fn invoke(&self, request: &ActionRequest) -> Result<Envelope, ActionError> {
        self.invoker
            .invoke(request, self.timeouts.for_action(request.action))
            .await
    }

    /// Best-effort "last used" stamp.
    pub async fn touch_credentials(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .stores
            .credentials
            .mark_used(user_id, marketplace_id, now)
            .await
        {
            warn!(user_id = %user_id, marketplace_id = %marketplace_id, error = %e, "failed to stamp credentials");
        }
    }
}
