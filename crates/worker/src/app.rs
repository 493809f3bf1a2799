//! Wiring between CLI commands and the pipelines.

use std::sync::Arc;

use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};

use marketsync_core::{MarketplaceId, UserId};
use marketsync_infra::jobs::{JobScope, StatusCounts};
use marketsync_pipelines::catalog::{self, CatalogStart, CatalogSyncWorker};
use marketsync_pipelines::identifiers::IdentifierWorker;
use marketsync_pipelines::listing::{self, ListingImportWorker, ListingRequestWorker};
use marketsync_pipelines::order_items::{self, OrderItemsWorker};
use marketsync_pipelines::orders::{self, OrderSyncWorker};
use marketsync_pipelines::reviews::{self, ReviewRequestWorker};
use marketsync_pipelines::{Context, Worker};

use crate::cli::{AccountArgs, DispatchKind, PipelineArg};
use crate::config::PipelineSettings;

pub fn build_worker(
    pipeline: PipelineArg,
    ctx: &Context,
    settings: &PipelineSettings,
    scope: JobScope,
) -> Arc<dyn Worker> {
    let ctx = ctx.clone();
    match pipeline {
        PipelineArg::Catalog => {
            Arc::new(CatalogSyncWorker::new(ctx, settings.catalog.clone()).scoped(scope))
        }
        PipelineArg::ListingRequest => {
            Arc::new(ListingRequestWorker::new(ctx, settings.listing.clone()).scoped(scope))
        }
        PipelineArg::ListingImport => Arc::new(ListingImportWorker::new(ctx).scoped(scope)),
        PipelineArg::Orders => {
            Arc::new(OrderSyncWorker::new(ctx, settings.orders.clone()).scoped(scope))
        }
        PipelineArg::OrderItems => {
            Arc::new(OrderItemsWorker::new(ctx, settings.order_items.clone()).scoped(scope))
        }
        PipelineArg::Identifiers => {
            Arc::new(IdentifierWorker::new(ctx, settings.identifiers.clone()).scoped(scope))
        }
        PipelineArg::Reviews => {
            Arc::new(ReviewRequestWorker::new(ctx, settings.reviews.clone()).scoped(scope))
        }
    }
}

/// One dispatch pass. Returns a JSON summary for the terminal.
pub async fn dispatch(
    kind: DispatchKind,
    ctx: &Context,
    settings: &PipelineSettings,
    account: &AccountArgs,
    force: bool,
    report_type: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<JsonValue> {
    let summary = match kind {
        DispatchKind::Catalog => {
            let (user_id, marketplace_id) = required_account(kind, account)?;
            match catalog::dispatch(ctx, &settings.catalog, user_id, marketplace_id, report_type, now)
                .await
                .context("catalog dispatch")?
            {
                CatalogStart::Queued(job) => json!({ "queued": job.id }),
                CatalogStart::Refused(decision) => json!({ "refused": decision }),
            }
        }
        DispatchKind::Listings => {
            let (user_id, marketplace_id) = required_account(kind, account)?;
            let created =
                listing::enqueue_missing(ctx, &settings.listing, user_id, marketplace_id, now)
                    .await
                    .context("listing enqueue")?;
            json!({ "created": created })
        }
        DispatchKind::Orders => {
            let (user_id, marketplace_id) = required_account(kind, account)?;
            let job = orders::dispatch(ctx, &settings.orders, user_id, marketplace_id, force, now)
                .await
                .context("order dispatch")?;
            match job {
                Some(job) => json!({ "queued": job.id, "from": job.details.from, "to": job.details.to }),
                None => json!({ "queued": null, "reason": "an order sync is already open" }),
            }
        }
        DispatchKind::ListingRequest => {
            let created = listing::dispatch_requests(ctx, &settings.listing, now)
                .await
                .context("listing request dispatch")?;
            json!({ "created": created })
        }
        DispatchKind::ListingImport => {
            let created = listing::dispatch_imports(ctx, &settings.listing, now)
                .await
                .context("listing import dispatch")?;
            json!({ "created": created })
        }
        DispatchKind::OrderItems => {
            let created = order_items::dispatch(ctx, &settings.order_items, now)
                .await
                .context("order items dispatch")?;
            json!({ "created": created })
        }
        DispatchKind::Reviews => {
            let created = reviews::dispatch(ctx, &settings.reviews, now)
                .await
                .context("review request dispatch")?;
            json!({ "created": created })
        }
    };
    Ok(summary)
}

fn required_account(
    kind: DispatchKind,
    account: &AccountArgs,
) -> anyhow::Result<(UserId, MarketplaceId)> {
    match account.account() {
        Some(pair) => Ok(pair),
        None => bail!("dispatch {kind:?} needs --user and --marketplace"),
    }
}

pub async fn stats(
    pipeline: PipelineArg,
    ctx: &Context,
    scope: JobScope,
) -> anyhow::Result<StatusCounts> {
    let stores = &ctx.stores;
    let counts = match pipeline {
        PipelineArg::Catalog => stores.catalog.counts(scope).await,
        PipelineArg::ListingRequest => stores.listing_requests.counts(scope).await,
        PipelineArg::ListingImport => stores.listing_imports.counts(scope).await,
        PipelineArg::Orders => stores.orders.counts(scope).await,
        PipelineArg::OrderItems => stores.order_items.counts(scope).await,
        PipelineArg::Identifiers => stores.identifiers.counts(scope).await,
        PipelineArg::Reviews => stores.reviews.counts(scope).await,
    };
    counts.with_context(|| format!("counting {pipeline:?} jobs"))
}
