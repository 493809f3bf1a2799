//! Core job types and policies.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use marketsync_core::{JobId, JobState, MarketplaceId, UserId};

use crate::activity::ActivityStream;

/// A queue table and the typed shape of its rows.
///
/// Implemented by zero-sized marker types (see [`super::kinds`]). The status
/// enum is closed; `Details` carries the pipeline-specific columns.
pub trait Pipeline: fmt::Debug + Clone + Send + Sync + 'static {
    type Status: JobState;
    type Details: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Queue table name.
    const TABLE: &'static str;

    /// Activity stream used for cooldown detection, if the pipeline keeps one.
    const ACTIVITY: Option<ActivityStream> = None;
}

/// Which rows a query may see.
///
/// Dispatch triggered from a user session passes an explicit account; background
/// workers use `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobScope {
    #[default]
    All,
    Account {
        user_id: UserId,
        marketplace_id: MarketplaceId,
    },
}

impl JobScope {
    pub fn account(user_id: UserId, marketplace_id: MarketplaceId) -> Self {
        Self::Account {
            user_id,
            marketplace_id,
        }
    }

    pub fn admits(&self, user_id: UserId, marketplace_id: MarketplaceId) -> bool {
        match self {
            JobScope::All => true,
            JobScope::Account {
                user_id: u,
                marketplace_id: m,
            } => *u == user_id && *m == marketplace_id,
        }
    }

    pub(crate) fn parts(&self) -> (Option<UserId>, Option<MarketplaceId>) {
        match self {
            JobScope::All => (None, None),
            JobScope::Account {
                user_id,
                marketplace_id,
            } => (Some(*user_id), Some(*marketplace_id)),
        }
    }
}

/// A persisted queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord<P: Pipeline> {
    pub id: JobId,
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    /// Natural key (order id, asin id, identifier, parent id for phase rows).
    pub natural_key: String,
    pub status: P::Status,
    pub attempts: u32,
    /// Not eligible before this instant.
    pub run_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub details: P::Details,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<P: Pipeline> JobRecord<P> {
    /// Check if `run_after` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_after.is_none_or(|at| at <= now)
    }

    /// Move to a non-terminal status without touching error bookkeeping.
    pub fn transition(&mut self, status: P::Status, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// Finish successfully.
    pub fn complete(&mut self, status: P::Status, now: DateTime<Utc>) {
        self.status = status;
        self.run_after = None;
        self.last_error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Record a soft failure that becomes eligible again at `retry_at`.
    pub fn retry_at(
        &mut self,
        status: P::Status,
        error: impl Into<String>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.last_error = Some(error.into());
        self.run_after = Some(retry_at);
        self.updated_at = now;
    }

    /// Record a failure in `status` (terminal or awaiting a retry claim).
    pub fn fail(&mut self, status: P::Status, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.last_error = Some(error.into());
        if status.is_terminal() {
            self.run_after = None;
            self.finished_at = Some(now);
        }
        self.updated_at = now;
    }
}

/// A row about to be inserted by a dispatcher.
#[derive(Debug, Clone)]
pub struct NewJob<P: Pipeline> {
    pub user_id: UserId,
    pub marketplace_id: MarketplaceId,
    pub natural_key: String,
    pub status: P::Status,
    pub run_after: Option<DateTime<Utc>>,
    pub details: P::Details,
}

impl<P: Pipeline> NewJob<P> {
    pub fn new(
        user_id: UserId,
        marketplace_id: MarketplaceId,
        natural_key: impl Into<String>,
        status: P::Status,
        details: P::Details,
    ) -> Self {
        Self {
            user_id,
            marketplace_id,
            natural_key: natural_key.into(),
            status,
            run_after: None,
            details,
        }
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }
}

/// When an insert counts as a duplicate of an existing row with the same
/// (user, marketplace, natural key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateRule<S> {
    /// Any existing row blocks the insert.
    AnyStatus,
    /// Only rows currently in one of these statuses block the insert.
    AmongStatuses(Vec<S>),
}

impl<S: JobState> DuplicateRule<S> {
    pub fn blocks(&self, status: S) -> bool {
        match self {
            DuplicateRule::AnyStatus => true,
            DuplicateRule::AmongStatuses(set) => set.contains(&status),
        }
    }
}

/// Row counts per persisted status string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusCounts(BTreeMap<String, u64>);

impl StatusCounts {
    pub fn add(&mut self, status: &str, n: u64) {
        *self.0.entry(status.to_string()).or_default() += n;
    }

    pub fn get<S: JobState>(&self, status: S) -> u64 {
        self.0.get(status.as_str()).copied().unwrap_or_default()
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts before a job is given up
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(6 * 3600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay after a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// When a job that just failed its `attempt`-th try becomes eligible again.
    ///
    /// A positive `hint_minutes` (the adapter's `retry_after_minutes`) overrides
    /// the computed delay.
    pub fn next_run_after(
        &self,
        attempt: u32,
        hint_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = match hint_minutes.filter(|m| *m > 0) {
            Some(minutes) => chrono::Duration::try_minutes(minutes).unwrap_or(chrono::Duration::MAX),
            None => to_chrono(self.delay_for_attempt(attempt)),
        };
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Convert a std duration, saturating instead of failing on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
