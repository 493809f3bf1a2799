//! Process configuration: CLI flags with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use marketsync_infra::external::{ActionTimeouts, AdapterLayout};
use marketsync_observability::LogFormat;
use marketsync_pipelines::catalog::CatalogSyncSettings;
use marketsync_pipelines::identifiers::IdentifierSettings;
use marketsync_pipelines::listing::ListingSyncSettings;
use marketsync_pipelines::order_items::OrderItemsSettings;
use marketsync_pipelines::orders::OrderSyncSettings;
use marketsync_pipelines::reviews::ReviewRequestSettings;

use crate::runner::RunnerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormatArg {
    #[default]
    Json,
    Pretty,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "MARKETSYNC_DB_MAX_CONNECTIONS", default_value_t = 4, global = true)]
    pub max_connections: u32,

    /// Directory holding one adapter executable per action.
    #[arg(long, env = "MARKETSYNC_ACTIONS_DIR", default_value = "actions", global = true)]
    pub actions_dir: PathBuf,

    /// Interpreter the adapters run under (`php`, `python3`, ...).
    #[arg(long, env = "MARKETSYNC_ACTION_INTERPRETER", global = true)]
    pub action_interpreter: Option<PathBuf>,

    /// File extension of the adapter scripts, e.g. `.php`.
    #[arg(long, env = "MARKETSYNC_ACTION_EXTENSION", global = true)]
    pub action_extension: Option<String>,

    /// Seconds to sleep when nothing is due.
    #[arg(long, env = "MARKETSYNC_IDLE_SLEEP_SECS", default_value_t = 10, global = true)]
    pub idle_sleep_secs: u64,

    /// Seconds to sleep after a storage error.
    #[arg(long, env = "MARKETSYNC_ERROR_SLEEP_SECS", default_value_t = 30, global = true)]
    pub error_sleep_secs: u64,

    /// Rows examined per dispatch pass.
    #[arg(long, env = "MARKETSYNC_BATCH_SIZE", default_value_t = 100, global = true)]
    pub batch_size: usize,

    #[arg(long, env = "MARKETSYNC_START_TIMEOUT_SECS", default_value_t = 120, global = true)]
    pub start_timeout_secs: u64,

    #[arg(long, env = "MARKETSYNC_POLL_TIMEOUT_SECS", default_value_t = 3600, global = true)]
    pub poll_timeout_secs: u64,

    #[arg(long, env = "MARKETSYNC_IMPORT_TIMEOUT_SECS", default_value_t = 7200, global = true)]
    pub import_timeout_secs: u64,

    #[arg(long, env = "MARKETSYNC_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json, global = true)]
    pub log_format: LogFormatArg,
}

impl WorkerConfig {
    pub fn log_format(&self) -> LogFormat {
        match self.log_format {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }

    pub fn timeouts(&self) -> ActionTimeouts {
        ActionTimeouts {
            start: Duration::from_secs(self.start_timeout_secs),
            poll: Duration::from_secs(self.poll_timeout_secs),
            import: Duration::from_secs(self.import_timeout_secs),
        }
    }

    pub fn adapter_layout(&self) -> AdapterLayout {
        AdapterLayout::PerAction {
            dir: self.actions_dir.clone(),
            interpreter: self.action_interpreter.clone(),
            extension: self.action_extension.clone(),
        }
    }

    pub fn runner_options(&self, once: bool, max_jobs: Option<u64>) -> RunnerOptions {
        RunnerOptions {
            idle_sleep: Duration::from_secs(self.idle_sleep_secs),
            error_sleep: Duration::from_secs(self.error_sleep_secs),
            once,
            max_jobs,
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.listing.dispatch_batch = self.batch_size;
        settings.order_items.dispatch_batch = self.batch_size;
        settings.reviews.dispatch_batch = self.batch_size;
        settings
    }
}

/// Tunables of every pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub catalog: CatalogSyncSettings,
    pub listing: ListingSyncSettings,
    pub orders: OrderSyncSettings,
    pub order_items: OrderItemsSettings,
    pub identifiers: IdentifierSettings,
    pub reviews: ReviewRequestSettings,
}
