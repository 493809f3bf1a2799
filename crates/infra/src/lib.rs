//! Infrastructure layer: queue storage, activity streams, account and
//! commerce data, external adapter invocation.

pub mod accounts;
pub mod activity;
pub mod commerce;
pub mod external;
pub mod jobs;
pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;
