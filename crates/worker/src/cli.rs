use clap::{Args, Parser, Subcommand, ValueEnum};

use marketsync_core::{MarketplaceId, UserId};
use marketsync_infra::jobs::JobScope;

use crate::config::WorkerConfig;

/// Marketplace sync job engine.
#[derive(Parser, Debug)]
#[command(name = "marketsync", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: WorkerConfig,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the worker loop of one pipeline.
    Work(WorkArgs),
    /// Run one dispatch pass.
    Dispatch(DispatchArgs),
    /// Print job counts by status.
    Stats(StatsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PipelineArg {
    Catalog,
    ListingRequest,
    ListingImport,
    Orders,
    OrderItems,
    Identifiers,
    Reviews,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DispatchKind {
    /// Queue a catalog sync for one account.
    Catalog,
    /// Queue listing syncs for one account's ASINs without a snapshot.
    Listings,
    ListingRequest,
    ListingImport,
    /// Queue an order sync for one account.
    Orders,
    OrderItems,
    Reviews,
}

/// Optional `--user`/`--marketplace` pair.
#[derive(Args, Debug, Clone, Default)]
pub struct AccountArgs {
    #[arg(long, requires = "marketplace")]
    pub user: Option<UserId>,

    #[arg(long, requires = "user")]
    pub marketplace: Option<MarketplaceId>,
}

impl AccountArgs {
    pub fn account(&self) -> Option<(UserId, MarketplaceId)> {
        self.user.zip(self.marketplace)
    }

    pub fn scope(&self) -> JobScope {
        match self.account() {
            Some((user_id, marketplace_id)) => JobScope::account(user_id, marketplace_id),
            None => JobScope::All,
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkArgs {
    #[arg(value_enum)]
    pub pipeline: PipelineArg,

    /// Exit once nothing is due.
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Stop after this many claimed jobs.
    #[arg(long)]
    pub max_jobs: Option<u64>,

    /// Only claim jobs of this account.
    #[command(flatten)]
    pub account: AccountArgs,
}

#[derive(Args, Debug)]
pub struct DispatchArgs {
    #[arg(value_enum)]
    pub kind: DispatchKind,

    #[command(flatten)]
    pub account: AccountArgs,

    /// Orders: ignore the previous run and fetch the fallback window.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Catalog: report type to request instead of the default.
    #[arg(long)]
    pub report_type: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[arg(value_enum)]
    pub pipeline: PipelineArg,

    #[command(flatten)]
    pub account: AccountArgs,
}
