//! Queue engine shared by every sync pipeline.
//!
//! ## Design
//!
//! - One table per pipeline, all with the same common columns
//! - Closed status enum per table; unknown values fail at decode time
//! - Claims happen in one short transaction: scan, lock, re-check, mark, commit
//! - Work proceeds outside any lock; outcomes are written back with `save`
//!
//! ## Components
//!
//! - `Pipeline`: marker trait binding a table to its status and detail types
//! - `ClaimPolicy`: eligibility predicate, ordering key and claim transition
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `RetryPolicy`: backoff between soft failures

pub mod claim;
pub mod kinds;
pub mod store;
pub mod types;

pub use claim::{ClaimMark, ClaimOrder, ClaimPolicy, StuckReclaim};
pub use kinds::{
    CatalogSync, CatalogSyncDetails, IdentifierDetails, ListingImport, ListingImportDetails,
    ListingRequest, ListingRequestDetails, ListingSync, ListingSyncDetails, OrderItemsDetails,
    OrderItemsSync, OrderSync, OrderSyncDetails, ReviewRequest, ReviewRequestDetails,
    UnresolvedIdentifier,
};
pub use store::{JobRow, JobStore, StoreError};
pub use types::{
    BackoffStrategy, DuplicateRule, JobRecord, JobScope, NewJob, Pipeline, RetryPolicy,
    StatusCounts, to_chrono,
};
