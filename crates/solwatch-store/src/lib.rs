//! This is the solwatch-store crate - the persistence gateway for indexer
//! state, subscriptions, event history, and periodic stats.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryGateway;
pub use postgres::PostgresGateway;
pub use traits::{CachedBalanceRow, Gateway, Page, SlotRange};
