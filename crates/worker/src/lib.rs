//! The `marketsync` worker process: configuration, CLI and the worker loop.

pub mod app;
pub mod cli;
pub mod config;
pub mod runner;

pub use cli::Cli;
pub use config::{PipelineSettings, WorkerConfig};
pub use runner::{Runner, RunnerOptions, RunnerStats, StopReason};
