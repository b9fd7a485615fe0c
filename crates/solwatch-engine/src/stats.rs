//! Periodic stats snapshots.
//!
//! A background task samples pipeline counters and table totals on a fixed
//! interval and appends one row per tick. A failed tick is logged and
//! skipped; the next tick tries again.

use {
    chrono::Utc,
    std::{sync::Arc, time::Duration},
    tokio::sync::watch,
    tracing::{debug, warn},
    uuid::Uuid,
    solwatch_common::types::IndexerStats,
    solwatch_store::Gateway,
    crate::metrics::Metrics,
};

pub struct StatsAggregator {
    gateway: Arc<dyn Gateway>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl StatsAggregator {
    pub fn new(gateway: Arc<dyn Gateway>, metrics: Arc<Metrics>, interval: Duration) -> Self {
        Self { gateway, metrics, interval }
    }

    /// Run until the shutdown signal flips. Does not record a final
    /// snapshot on shutdown; partial intervals are not interesting.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; skip the startup tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.snapshot().await {
                        warn!("Stats snapshot failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Stats aggregator stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn snapshot(&self) -> anyhow::Result<()> {
        let stats = self.collect().await?;
        self.gateway.record_stats(&stats).await?;
        debug!(
            "Recorded stats: {} keys, {} balance updates, {} transactions, slot {}",
            stats.total_keys_monitored,
            stats.total_balance_updates,
            stats.total_transactions,
            stats.last_processed_slot,
        );
        Ok(())
    }

    async fn collect(&self) -> anyhow::Result<IndexerStats> {
        let state = self.gateway.latest_state().await?;
        Ok(IndexerStats {
            id: Uuid::new_v4().to_string(),
            total_keys_monitored: self.gateway.count_active_keys().await? as i32,
            total_balance_updates: self.gateway.count_balance_updates().await?,
            total_transactions: self.gateway.count_transaction_events().await?,
            last_processed_slot: state.last_processed_slot,
            avg_processing_time_ms: self.metrics.avg_processing_ms(),
            errors_last_hour: self.metrics.errors_last_hour() as i32,
            uptime_seconds: self.metrics.uptime_seconds(),
            recorded_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use solwatch_common::types::{BalanceUpdate, SubscribedKey, SubscriptionType};
    use solwatch_store::MemoryGateway;

    const K1: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    #[tokio::test]
    async fn snapshot_reflects_counts_and_slot() {
        let gateway: Arc<dyn Gateway> = Arc::new(MemoryGateway::new());
        gateway.initialize().await.unwrap();
        gateway
            .upsert_subscription(&SubscribedKey::new(
                "U1".into(),
                K1.into(),
                SubscriptionType::Both,
            ))
            .await
            .unwrap();
        gateway
            .commit_balance_update(&BalanceUpdate::baseline(
                "U1".into(),
                K1.into(),
                "mint".into(),
                Decimal::from(5),
                42,
                None,
            ))
            .await
            .unwrap();

        let metrics = Arc::new(Metrics::new());
        metrics.record_latency(Duration::from_millis(2));
        metrics.record_error();

        let aggregator =
            StatsAggregator::new(gateway.clone(), metrics, Duration::from_secs(60));
        let stats = aggregator.collect().await.unwrap();

        assert_eq!(stats.total_keys_monitored, 1);
        assert_eq!(stats.total_balance_updates, 1);
        assert_eq!(stats.total_transactions, 0);
        assert_eq!(stats.last_processed_slot, 42);
        assert_eq!(stats.errors_last_hour, 1);
        assert!(stats.avg_processing_time_ms > 0.0);
    }

    #[tokio::test]
    async fn repeated_snapshots_append() {
        let gateway: Arc<dyn Gateway> = Arc::new(MemoryGateway::new());
        gateway.initialize().await.unwrap();
        let aggregator = StatsAggregator::new(
            gateway.clone(),
            Arc::new(Metrics::new()),
            Duration::from_secs(60),
        );

        aggregator.snapshot().await.unwrap();
        aggregator.snapshot().await.unwrap();
    }
}
