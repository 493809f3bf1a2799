//! The claim engine's eligibility predicate.
//!
//! Every pipeline claims work the same way:
//!
//! 1. scan for the oldest row matching the predicate (no lock),
//! 2. lock that row and evaluate the predicate again against the locked copy,
//! 3. apply the claim mark (status + attempt counter) and commit.
//!
//! Storage backends own steps 1 and 3. The predicate itself lives here so the
//! in-memory and Postgres backends cannot drift apart.

use chrono::{DateTime, Duration, Utc};

use marketsync_core::JobState;

use super::types::{JobRecord, JobScope, Pipeline};

/// Claim order within one pipeline (approximate FIFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimOrder {
    /// Oldest row id first.
    #[default]
    Id,
    /// Earliest `run_after` first (rows without one sort first), ties by id.
    RunAfter,
}

/// What a successful claim does to the locked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimMark<S> {
    /// Status written in the claim transaction.
    pub status: S,
    /// Whether this claim consumes an attempt. Only attempt-consuming claims
    /// are subject to `max_attempts`.
    pub counts_attempt: bool,
}

impl<S> ClaimMark<S> {
    /// Move to `status` and consume an attempt.
    pub fn attempt(status: S) -> Self {
        Self {
            status,
            counts_attempt: true,
        }
    }

    /// Continue a workflow already in flight: keep `status`, no attempt.
    pub fn resume(status: S) -> Self {
        Self {
            status,
            counts_attempt: false,
        }
    }
}

/// Orphan recovery: rows left in an in-flight status by a crashed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckReclaim<S> {
    pub status: S,
    /// Measured from `updated_at`, which the claim itself sets.
    pub after: Duration,
}

/// Eligibility predicate, ordering key and transition of one queue.
#[derive(Debug, Clone)]
pub struct ClaimPolicy<S: JobState> {
    pub eligible: Vec<S>,
    pub order: ClaimOrder,
    pub max_attempts: Option<u32>,
    /// Minimum quiet time since the newest of `updated_at` and the last
    /// activity entry.
    pub cooldown: Option<Duration>,
    pub reclaim: Option<StuckReclaim<S>>,
    pub scope: JobScope,
    pub mark: fn(S) -> ClaimMark<S>,
}

impl<S: JobState> ClaimPolicy<S> {
    pub fn new(eligible: impl Into<Vec<S>>, mark: fn(S) -> ClaimMark<S>) -> Self {
        Self {
            eligible: eligible.into(),
            order: ClaimOrder::Id,
            max_attempts: None,
            cooldown: None,
            reclaim: None,
            scope: JobScope::All,
            mark,
        }
    }

    pub fn ordered_by(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn reclaim_stuck(mut self, status: S, after: Duration) -> Self {
        self.reclaim = Some(StuckReclaim { status, after });
        self
    }

    pub fn scoped(mut self, scope: JobScope) -> Self {
        self.scope = scope;
        self
    }

    /// Statuses the claim may pick up at all (eligible set plus the reclaim status).
    pub fn candidate_statuses(&self) -> Vec<S> {
        let mut statuses = self.eligible.clone();
        if let Some(reclaim) = self.reclaim {
            if !statuses.contains(&reclaim.status) {
                statuses.push(reclaim.status);
            }
        }
        statuses
    }

    /// Candidate statuses whose claim does not consume an attempt.
    pub fn uncounted_statuses(&self) -> Vec<S> {
        self.candidate_statuses()
            .into_iter()
            .filter(|s| !(self.mark)(*s).counts_attempt)
            .collect()
    }

    /// Candidate statuses `max_attempts` never gates: uncounted claims and
    /// stuck reclaims. A reclaimed row past the cap is handed to the worker,
    /// which settles it instead of running it again.
    pub fn cap_exempt_statuses(&self) -> Vec<S> {
        let mut statuses = self.uncounted_statuses();
        if let Some(reclaim) = self.reclaim {
            if !self.eligible.contains(&reclaim.status) && !statuses.contains(&reclaim.status) {
                statuses.push(reclaim.status);
            }
        }
        statuses
    }

    /// Whether a claimed row has already used more attempts than the cap
    /// allows. Only a stuck reclaim can produce one.
    pub fn exhausted<P>(&self, job: &JobRecord<P>) -> bool
    where
        P: Pipeline<Status = S>,
    {
        self.max_attempts.is_some_and(|max| job.attempts > max)
    }

    fn status_qualifies(&self, status: S, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.eligible.contains(&status) {
            return true;
        }
        match self.reclaim {
            Some(reclaim) => reclaim.status == status && updated_at <= now - reclaim.after,
            None => false,
        }
    }

    /// Full predicate, evaluated against a locked row.
    pub fn admits<P>(
        &self,
        job: &JobRecord<P>,
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool
    where
        P: Pipeline<Status = S>,
    {
        if !self.scope.admits(job.user_id, job.marketplace_id) {
            return false;
        }
        if !self.status_qualifies(job.status, job.updated_at, now) {
            return false;
        }
        if !job.is_due(now) {
            return false;
        }
        if let Some(max) = self.max_attempts {
            if job.attempts >= max && !self.cap_exempt_statuses().contains(&job.status) {
                return false;
            }
        }
        if let Some(cooldown) = self.cooldown {
            let last = last_activity.map_or(job.updated_at, |a| a.max(job.updated_at));
            if now - last < cooldown {
                return false;
            }
        }
        true
    }

    /// Apply the claim mark to a row that passed [`Self::admits`].
    pub fn apply<P>(&self, job: &mut JobRecord<P>, now: DateTime<Utc>)
    where
        P: Pipeline<Status = S>,
    {
        let mark = (self.mark)(job.status);
        job.status = mark.status;
        if mark.counts_attempt {
            job.attempts += 1;
        }
        job.started_at.get_or_insert(now);
        job.updated_at = now;
    }

    /// Sort key implementing [`ClaimOrder`].
    pub fn order_key<P>(&self, job: &JobRecord<P>) -> (Option<DateTime<Utc>>, i64)
    where
        P: Pipeline<Status = S>,
    {
        match self.order {
            ClaimOrder::Id => (None, job.id.get()),
            ClaimOrder::RunAfter => (job.run_after, job.id.get()),
        }
    }
}
