//! Sync pipelines hosted by the queue engine.
//!
//! Each module owns one pipeline: its claim policy, its state machine and the
//! dispatcher that feeds it. Workers advance exactly one job per
//! [`Worker::run_once`] call and report what happened as a [`StepOutcome`].

mod backoff;
pub mod catalog;
pub mod context;
pub mod error;
pub mod identifiers;
pub mod listing;
pub mod order_items;
pub mod orders;
pub mod outcome;
pub mod reviews;
pub mod start_policy;

#[cfg(test)]
mod testing;

pub use context::{Backend, Context, Stores};
pub use error::{JobFailure, PipelineError};
pub use outcome::{StepOutcome, Worker};
pub use start_policy::{StartDecision, StartPolicy};
