//! This is the solwatch-stream crate - the adapter between the upstream
//! ledger feed and the reconciliation queue.

pub mod adapter;
pub mod pubsub;
pub mod source;

pub use adapter::{AdapterConfig, StreamAdapter};
pub use pubsub::PubsubSource;
pub use source::{KeySource, SourceConnection, UpdateSource};
