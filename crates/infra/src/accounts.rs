//! Seller account data consumed by the workers: credentials and marketplace mapping.
//!
//! Both are owned elsewhere. Workers only read them, plus a best-effort
//! "last used" stamp on credentials.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketsync_core::{MarketplaceId, UserId};

use crate::jobs::StoreError;

/// Secrets an adapter needs to call the marketplace API on a seller's behalf.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub role_arn: String,
    pub region: String,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("client_id", &self.client_id)
            .field("access_key_id", &self.access_key_id)
            .field("role_arn", &self.role_arn)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The active credential bundle for the account, if any.
    async fn active_credentials(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<CredentialBundle>, StoreError>;

    /// Stamp the credential as used. Callers ignore failures.
    async fn mark_used(
        &self,
        user_id: UserId,
        marketplace_id: MarketplaceId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// How the external API names a marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceInfo {
    pub id: MarketplaceId,
    /// External marketplace id (e.g. `A1PA6795UKMFR9`).
    pub external_id: String,
    pub country_code: String,
}

#[async_trait]
pub trait MarketplaceDirectory: Send + Sync {
    async fn marketplace(
        &self,
        marketplace_id: MarketplaceId,
    ) -> Result<Option<MarketplaceInfo>, StoreError>;
}
