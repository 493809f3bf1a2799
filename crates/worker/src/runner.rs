//! The claim/process/sleep loop around one [`Worker`].
//!
//! - polls again immediately after a [`StepOutcome::Worked`] cycle
//! - sleeps `idle_sleep` after `Idle` or `Deferred`
//! - sleeps `error_sleep` after a store error; one bad cycle never stops the loop
//! - stops at the next cycle boundary once shutdown is requested

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use marketsync_pipelines::{StepOutcome, Worker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    pub idle_sleep: Duration,
    pub error_sleep: Duration,
    /// Exit as soon as nothing is due instead of sleeping.
    pub once: bool,
    /// Stop after this many claimed jobs.
    pub max_jobs: Option<u64>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_secs(10),
            error_sleep: Duration::from_secs(30),
            once: false,
            max_jobs: None,
        }
    }
}

/// Counters kept by one loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub claims: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deferred: u64,
    pub idle_polls: u64,
    pub store_errors: u64,
}

impl RunnerStats {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Worked { succeeded, .. } => {
                self.claims += 1;
                if succeeded {
                    self.succeeded += 1;
                } else {
                    self.failed += 1;
                }
            }
            StepOutcome::Deferred { .. } => {
                self.claims += 1;
                self.deferred += 1;
            }
            StepOutcome::Idle => self.idle_polls += 1,
        }
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    Drained,
    MaxJobs,
}

pub struct Runner {
    worker: Arc<dyn Worker>,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(worker: Arc<dyn Worker>, options: RunnerOptions) -> Self {
        Self { worker, options }
    }

    /// Run until shutdown is signalled (or, in `once` mode, until idle).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> (StopReason, RunnerStats) {
        let name = self.worker.name();
        let started = Instant::now();
        let mut stats = RunnerStats::default();
        info!(pipeline = name, once = self.options.once, max_jobs = ?self.options.max_jobs, "worker started");

        let reason = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }
            if self
                .options
                .max_jobs
                .is_some_and(|max| stats.claims >= max)
            {
                break StopReason::MaxJobs;
            }

            let pause = match self.worker.run_once(Utc::now()).await {
                Ok(outcome) => {
                    stats.record(outcome);
                    if outcome.repoll_immediately() {
                        continue;
                    }
                    if self.options.once {
                        break StopReason::Drained;
                    }
                    debug!(pipeline = name, ?outcome, "nothing to do, sleeping");
                    self.options.idle_sleep
                }
                Err(err) => {
                    stats.store_errors += 1;
                    error!(pipeline = name, error = %err, "claim cycle failed");
                    if self.options.once {
                        break StopReason::Drained;
                    }
                    self.options.error_sleep
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() {
                        break StopReason::Shutdown;
                    }
                }
            }
        };

        info!(
            pipeline = name,
            reason = ?reason,
            claims = stats.claims,
            succeeded = stats.succeeded,
            failed = stats.failed,
            deferred = stats.deferred,
            idle_polls = stats.idle_polls,
            store_errors = stats.store_errors,
            uptime_secs = started.elapsed().as_secs(),
            "worker stopped"
        );
        (reason, stats)
    }
}
