//! This is the solwatch-engine crate - the reconciliation pipeline that
//! turns the raw ledger feed into classified, idempotent event history.

pub mod cache;
pub mod classify;
pub mod correlate;
pub mod indexer;
pub mod metrics;
pub mod reconcile;
pub mod registry;
pub mod stats;
pub mod status;

pub use cache::{BalanceCache, Observed};
pub use classify::Classifier;
pub use indexer::Indexer;
pub use metrics::Metrics;
pub use registry::SubscriptionRegistry;
