//! The "invoke external action" capability, independent of how adapters run.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use marketsync_core::JobId;

use super::envelope::Envelope;
use crate::accounts::CredentialBundle;

/// Adapter programs the pipelines call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    RequestReport,
    PollReport,
    ImportReport,
    GetCatalogItem,
    FetchOrders,
    FetchOrderItems,
    ResolveIdentifier,
    RequestReview,
}

impl Action {
    /// Program name under the adapter directory, also passed as `--action=`.
    pub fn name(&self) -> &'static str {
        match self {
            Action::RequestReport => "request_report",
            Action::PollReport => "poll_report",
            Action::ImportReport => "import_report",
            Action::GetCatalogItem => "get_catalog_item",
            Action::FetchOrders => "fetch_orders",
            Action::FetchOrderItems => "fetch_order_items",
            Action::ResolveIdentifier => "resolve_identifier",
            Action::RequestReview => "request_review",
        }
    }

    /// Timeout class of the action.
    pub fn phase(&self) -> ActionPhase {
        match self {
            Action::PollReport | Action::FetchOrders => ActionPhase::Poll,
            Action::ImportReport => ActionPhase::Import,
            _ => ActionPhase::Start,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    /// Short calls that start remote work or fetch one record.
    Start,
    /// Waiting on remote work, downloading results.
    Poll,
    /// Bulk import of a downloaded file.
    Import,
}

/// Hard per-phase timeouts. A timeout is handled exactly like a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTimeouts {
    pub start: Duration,
    pub poll: Duration,
    pub import: Duration,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(120),
            poll: Duration::from_secs(3600),
            import: Duration::from_secs(7200),
        }
    }
}

impl ActionTimeouts {
    pub fn for_action(&self, action: Action) -> Duration {
        match action.phase() {
            ActionPhase::Start => self.start,
            ActionPhase::Poll => self.poll,
            ActionPhase::Import => self.import,
        }
    }
}

/// Positional `--key=value` arguments of one adapter run.
#[derive(Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action: Action,
    args: Vec<(String, String)>,
}

const SECRET_KEYS: &[&str] = &["refresh_token", "client_secret", "secret_access_key"];

impl ActionRequest {
    pub fn new(action: Action, job_id: JobId) -> Self {
        Self {
            action,
            args: vec![("job_id".to_string(), job_id.to_string())],
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.push((key.into(), value.to_string()));
        self
    }

    /// Append the full credential bundle.
    pub fn credentials(self, bundle: &CredentialBundle) -> Self {
        self.arg("refresh_token", &bundle.refresh_token)
            .arg("client_id", &bundle.client_id)
            .arg("client_secret", &bundle.client_secret)
            .arg("access_key_id", &bundle.access_key_id)
            .arg("secret_access_key", &bundle.secret_access_key)
            .arg("role_arn", &bundle.role_arn)
            .arg("region", &bundle.region)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_argv(&self) -> Vec<String> {
        self.args.iter().map(|(k, v)| format!("--{k}={v}")).collect()
    }
}

impl fmt::Debug for ActionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| {
                if SECRET_KEYS.contains(&k.as_str()) {
                    format!("{k}=***")
                } else {
                    format!("{k}={v}")
                }
            })
            .collect();
        f.debug_struct("ActionRequest")
            .field("action", &self.action)
            .field("args", &args)
            .finish()
    }
}

/// Every variant is a soft failure from the pipelines' point of view.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("{action}: failed to start adapter: {message}")]
    Spawn { action: Action, message: String },
    #[error("{action}: timed out after {}s", after.as_secs())]
    Timeout { action: Action, after: Duration },
    #[error("{action}: no result envelope on stdout (exit code {exit_code:?}): {stderr}")]
    MissingEnvelope {
        action: Action,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("{action}: malformed result envelope: {message}")]
    MalformedEnvelope { action: Action, message: String },
    #[error("{action}: {message}")]
    Rejected {
        action: Action,
        message: String,
        status: Option<String>,
        retry_after_minutes: Option<i64>,
    },
}

impl ActionError {
    pub fn retry_after_minutes(&self) -> Option<i64> {
        match self {
            ActionError::Rejected {
                retry_after_minutes, ..
            } => *retry_after_minutes,
            _ => None,
        }
    }

    /// Sub-outcome reported by a rejecting adapter.
    pub fn status(&self) -> Option<&str> {
        match self {
            ActionError::Rejected { status, .. } => status.as_deref(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Run the adapter and return its envelope, whatever its `success` flag.
    async fn invoke(
        &self,
        request: &ActionRequest,
        timeout: Duration,
    ) -> Result<Envelope, ActionError>;

    /// Run the adapter and require `success: true`.
    async fn run(&self, request: &ActionRequest, timeout: Duration) -> Result<Envelope, ActionError> {
        self.invoke(request, timeout)
            .await?
            .require_success(request.action)
    }
}
