//! `marketsync-core`: shared primitives for the sync engine.
//!
//! This crate contains **pure** types only (no IO): identifiers, the domain
//! error, and the closed status vocabulary of every queue table.

pub mod error;
pub mod id;
pub mod status;

pub use error::DomainError;
pub use id::{AsinId, JobId, MarketplaceId, UserId};
pub use status::{
    CatalogSyncStatus, IdentifierStatus, JobState, ListingPhaseStatus, ListingStage,
    ListingSyncStatus, OrderItemsStatus, OrderSyncStatus, ReviewRequestStatus,
};
