//! Test doubles shared by the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

use marketsync_core::{MarketplaceId, UserId};
use marketsync_infra::InMemoryStore;
use marketsync_infra::accounts::{CredentialBundle, CredentialProvider, MarketplaceInfo};
use marketsync_infra::external::{
    Action, ActionError, ActionInvoker, ActionRequest, ActionTimeouts, Envelope,
};
use marketsync_infra::jobs::StoreError;

use crate::context::{Context, Stores};

/// Adapter double: queued replies per action, every request recorded.
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<Action, VecDeque<Result<Envelope, ActionError>>>>,
    calls: Mutex<Vec<(ActionRequest, Duration)>>,
}

impl ScriptedInvoker {
    pub fn reply(&self, action: Action, reply: Result<Envelope, ActionError>) {
        self.replies
            .lock()
            .unwrap()
            .entry(action)
            .or_default()
            .push_back(reply);
    }

    pub fn succeed(&self, action: Action, data: JsonValue) {
        self.reply(
            action,
            Ok(Envelope {
                success: true,
                data,
                ..Default::default()
            }),
        );
    }

    pub fn fail(&self, action: Action, message: &str, retry_after_minutes: Option<i64>) {
        self.reply(
            action,
            Ok(Envelope {
                success: false,
                error: Some(message.to_string()),
                retry_after_minutes,
                ..Default::default()
            }),
        );
    }

    pub fn calls(&self) -> Vec<(ActionRequest, Duration)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, action: Action) -> Vec<ActionRequest> {
        self.calls()
            .into_iter()
            .filter(|(r, _)| r.action == action)
            .map(|(r, _)| r)
            .collect()
    }
}

#[async_trait]
impl ActionInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &ActionRequest,
        timeout: Duration,
    ) -> Result<Envelope, ActionError> {
        self.calls.lock().unwrap().push((request.clone(), timeout));
        self.replies
            .lock()
            .unwrap()
            .get_mut(&request.action)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(ActionError::MissingEnvelope {
                action: request.action,
                exit_code: Some(1),
                stderr: "no scripted reply".to_string(),
            }))
    }
}

/// Credential store whose every lookup fails, as when the database drops
/// between a claim and the account lookup.
pub struct UnreachableCredentials;

#[async_trait]
impl CredentialProvider for UnreachableCredentials {
    async fn active_credentials(
        &self,
        _user_id: UserId,
        _marketplace_id: MarketplaceId,
    ) -> Result<Option<CredentialBundle>, StoreError> {
        Err(StoreError::Storage("connection reset by peer".into()))
    }

    async fn mark_used(
        &self,
        _user_id: UserId,
        _marketplace_id: MarketplaceId,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Storage("connection reset by peer".into()))
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 20, 9, 0, 0).unwrap()
}

pub fn bundle() -> CredentialBundle {
    CredentialBundle {
        refresh_token: "Atzr|token".into(),
        client_id: "client".into(),
        client_secret: "secret".into(),
        access_key_id: "AKIA".into(),
        secret_access_key: "wJal".into(),
        role_arn: "arn:aws:iam::1:role/sp".into(),
        region: "eu-west-1".into(),
    }
}

/// In-memory backend with one fully configured seller account.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub invoker: Arc<ScriptedInvoker>,
    pub ctx: Context,
    pub user: UserId,
    pub marketplace: MarketplaceId,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let invoker = Arc::new(ScriptedInvoker::default());
        let user = UserId::new();
        let marketplace = MarketplaceId::new();

        store
            .seed_marketplace(MarketplaceInfo {
                id: marketplace,
                external_id: "A1PA6795UKMFR9".into(),
                country_code: "DE".into(),
            })
            .unwrap();
        store.seed_credentials(user, marketplace, bundle()).unwrap();

        let ctx = Context::new(
            Stores::from_backend(store.clone()),
            invoker.clone(),
            ActionTimeouts::default(),
        );
        Self {
            store,
            invoker,
            ctx,
            user,
            marketplace,
        }
    }

    /// The same backend, except that credential lookups fail.
    pub fn ctx_with_unreachable_credentials(&self) -> Context {
        let mut ctx = self.ctx.clone();
        ctx.stores.credentials = Arc::new(UnreachableCredentials);
        ctx
    }

    /// A second account on the same backend without credentials.
    pub fn account_without_credentials(&self) -> (UserId, MarketplaceId) {
        (UserId::new(), self.marketplace)
    }
}
