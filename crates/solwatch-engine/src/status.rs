//! Lifecycle status state machine for the singleton indexer state row.
//!
//! `starting -> running` on the first successfully processed update,
//! `running <-> error` on stream/persistence degradation and recovery,
//! `-> stopped` on shutdown. `stopped` is terminal; `error` is not.

use {
    std::sync::Arc,
    tokio::sync::Mutex,
    tracing::{info, warn},
    solwatch_common::types::IndexerStatus,
    solwatch_store::Gateway,
};

pub struct StatusHandle {
    gateway: Arc<dyn Gateway>,
    current: Mutex<IndexerStatus>,
}

impl StatusHandle {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway, current: Mutex::new(IndexerStatus::Starting) }
    }

    pub async fn current(&self) -> IndexerStatus {
        *self.current.lock().await
    }

    /// First successful processing, or recovery from `error`.
    pub async fn mark_running(&self) {
        self.transition(IndexerStatus::Running, |s| {
            matches!(s, IndexerStatus::Starting | IndexerStatus::Error)
        })
        .await;
    }

    /// Stream offline or persistence retries exhausted.
    pub async fn mark_error(&self) {
        self.transition(IndexerStatus::Error, |s| {
            matches!(s, IndexerStatus::Starting | IndexerStatus::Running)
        })
        .await;
    }

    pub async fn mark_stopped(&self) {
        self.transition(IndexerStatus::Stopped, |s| !matches!(s, IndexerStatus::Stopped))
            .await;
    }

    async fn transition(&self, to: IndexerStatus, allowed: impl Fn(IndexerStatus) -> bool) {
        let mut current = self.current.lock().await;
        if !allowed(*current) {
            return;
        }
        info!("Indexer status {:?} -> {:?}", *current, to);
        *current = to;

        // The persisted row is observability state; a write failure must not
        // take down the pipeline.
        if let Err(e) = self.gateway.set_status(to).await {
            warn!("Failed to persist status transition: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solwatch_store::MemoryGateway;

    #[tokio::test]
    async fn follows_the_lifecycle() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.initialize().await.unwrap();
        let status = StatusHandle::new(gateway.clone());

        assert_eq!(status.current().await, IndexerStatus::Starting);

        status.mark_running().await;
        assert_eq!(status.current().await, IndexerStatus::Running);
        assert_eq!(gateway.latest_state().await.unwrap().status, IndexerStatus::Running);

        status.mark_error().await;
        assert_eq!(status.current().await, IndexerStatus::Error);

        // Error is recoverable.
        status.mark_running().await;
        assert_eq!(status.current().await, IndexerStatus::Running);

        status.mark_stopped().await;
        assert_eq!(status.current().await, IndexerStatus::Stopped);

        // Stopped is terminal.
        status.mark_running().await;
        assert_eq!(status.current().await, IndexerStatus::Stopped);
    }
}
