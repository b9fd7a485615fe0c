use {
    anyhow::Result,
    async_trait::async_trait,
    solwatch_common::types::{KeyFilter, RawUpdate},
};

/// A live connection to the upstream feed, subscribed to one key set.
///
/// Delivery is at-least-once: after a reconnect the same (key, slot,
/// signature) update may be seen again.
#[async_trait]
pub trait SourceConnection: Send {
    /// Next normalized update. `Ok(None)` means the stream ended cleanly;
    /// an error means the connection dropped.
    async fn recv(&mut self) -> Result<Option<RawUpdate>>;

    /// Adjust the subscription to a new key set without tearing down the
    /// connection.
    async fn resubscribe(&mut self, filters: &[KeyFilter]) -> Result<()>;

    async fn close(&mut self);
}

/// Factory for upstream connections.
#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    async fn connect(&self, filters: &[KeyFilter]) -> Result<Box<dyn SourceConnection>>;
}

/// Read-mostly provider of the active key set. Implemented by the
/// subscription registry; the adapter polls it for snapshot copies.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    async fn active_filters(&self) -> Vec<KeyFilter>;
}
