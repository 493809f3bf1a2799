use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;

use marketsync_infra::PgStore;
use marketsync_infra::external::ProcessInvoker;
use marketsync_pipelines::{Context, Stores};
use marketsync_worker::Runner;
use marketsync_worker::app;
use marketsync_worker::cli::{Cli, Command};
use marketsync_worker::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    marketsync_observability::init(cli.config.log_format());

    let ctx = connect(&cli.config).await?;
    let settings = cli.config.settings();

    match cli.command {
        Command::Work(args) => {
            let worker = app::build_worker(args.pipeline, &ctx, &settings, args.account.scope());
            let runner = Runner::new(worker, cli.config.runner_options(args.once, args.max_jobs));

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested, finishing the current job");
                    let _ = shutdown_tx.send(true);
                }
            });

            // Stats are logged by the runner on exit.
            runner.run(shutdown_rx).await;
        }
        Command::Dispatch(args) => {
            let summary = app::dispatch(
                args.kind,
                &ctx,
                &settings,
                &args.account,
                args.force,
                args.report_type.as_deref(),
                Utc::now(),
            )
            .await?;
            println!("{summary}");
        }
        Command::Stats(args) => {
            let counts = app::stats(args.pipeline, &ctx, args.account.scope()).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }
    Ok(())
}

async fn connect(config: &WorkerConfig) -> anyhow::Result<Context> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let store = PgStore::connect(database_url, config.max_connections)
        .await
        .context("connecting to postgres")?;
    let invoker = ProcessInvoker::new(config.adapter_layout());
    Ok(Context::new(
        Stores::from_backend(Arc::new(store)),
        Arc::new(invoker),
        config.timeouts(),
    ))
}
