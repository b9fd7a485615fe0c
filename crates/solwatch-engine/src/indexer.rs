//! Wires the pipeline together: stream adapter -> dispatcher -> partitioned
//! reconcile workers, with the stats aggregator running alongside.

use {
    anyhow::Result,
    std::{
        collections::hash_map::DefaultHasher,
        hash::{Hash, Hasher},
        sync::{atomic::Ordering, Arc},
        time::Duration,
    },
    tokio::{
        sync::{mpsc, watch},
        task::JoinSet,
    },
    tracing::{error, info, warn},
    solwatch_common::{
        types::{RawUpdate, StreamEvent},
        Config,
    },
    solwatch_store::Gateway,
    solwatch_stream::{AdapterConfig, StreamAdapter, UpdateSource},
    crate::{
        cache::BalanceCache,
        classify::Classifier,
        correlate::TxnCorrelator,
        metrics::Metrics,
        reconcile::{QueuedUpdate, ReconcileContext, ReconcileWorker},
        registry::SubscriptionRegistry,
        stats::StatsAggregator,
        status::StatusHandle,
    },
};

pub struct Indexer {
    config: Config,
    gateway: Arc<dyn Gateway>,
    registry: Arc<SubscriptionRegistry>,
    source: Arc<dyn UpdateSource>,
}

impl Indexer {
    /// Initialize storage and load the active subscription set.
    pub async fn new(
        config: Config,
        gateway: Arc<dyn Gateway>,
        source: Arc<dyn UpdateSource>,
    ) -> Result<Self> {
        gateway.initialize().await?;
        let registry = SubscriptionRegistry::new(gateway.clone()).await?;
        Ok(Self { config, gateway, registry, source })
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    /// Run the full pipeline until `shutdown` flips. Drains in-flight
    /// updates within the configured grace period, then marks the
    /// persisted status `stopped`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let cache = Arc::new(BalanceCache::new());
        cache.hydrate(self.gateway.load_latest_balances().await?);
        info!("Balance cache hydrated from event history");

        let metrics = Arc::new(Metrics::new());
        let status = Arc::new(StatusHandle::new(self.gateway.clone()));
        let ctx = Arc::new(ReconcileContext {
            gateway: self.gateway.clone(),
            registry: self.registry.clone(),
            cache: cache.clone(),
            classifier: Arc::new(Classifier::new(self.config.swap_programs.iter().cloned())),
            correlator: Arc::new(TxnCorrelator::new()),
            metrics: metrics.clone(),
            status: status.clone(),
        });

        // One bounded queue per worker; a key always hashes to the same
        // worker, so its updates are applied in arrival order.
        let worker_count = self.config.worker_count.max(1);
        let mut worker_txs = Vec::with_capacity(worker_count);
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel::<QueuedUpdate>(self.config.queue_depth.max(1));
            worker_txs.push(tx);
            workers.spawn(ReconcileWorker::new(id, ctx.clone()).run(rx));
        }

        let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(self.config.queue_depth.max(1));
        let adapter = StreamAdapter::new(
            self.source.clone(),
            self.registry.clone(),
            AdapterConfig {
                key_refresh: Duration::from_secs(self.config.key_refresh_secs),
                base_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(self.config.max_backoff_secs),
                max_reconnect_attempts: self.config.max_reconnect_attempts,
            },
        );
        let adapter_shutdown = shutdown.clone();
        let adapter_handle = tokio::spawn(async move {
            if let Err(e) = adapter.run(event_tx, adapter_shutdown).await {
                error!("Stream adapter exited with error: {}", e);
            }
        });

        let aggregator = StatsAggregator::new(
            self.gateway.clone(),
            metrics.clone(),
            Duration::from_secs(self.config.stats_interval_secs),
        );
        let stats_handle = tokio::spawn(aggregator.run(shutdown.clone()));

        info!("Indexer pipeline started with {} workers", worker_count);
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(StreamEvent::Update(update)) => {
                            let partition = partition_for(&update, worker_count);
                            // Stamp before queueing: a gap that lands later
                            // must not retroactively apply to this update.
                            let queued = QueuedUpdate { update, epoch: cache.current_epoch() };
                            if worker_txs[partition].send(queued).await.is_err() {
                                metrics.updates_dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("Worker {} queue closed, update dropped", partition);
                            }
                        }
                        Some(StreamEvent::Gap) => {
                            warn!("Gap in the stream, resetting balance baselines");
                            cache.mark_gap();
                        }
                        Some(StreamEvent::Offline) => {
                            error!("Stream offline, reconnect budget exhausted");
                            status.mark_error().await;
                        }
                        None => {
                            info!("Stream adapter channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown requested, draining pipeline");
                        break;
                    }
                }
            }
        }

        // Dropping the senders lets each worker drain its queue and exit.
        drop(worker_txs);
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Drain exceeded {:?}, abandoning in-flight updates", grace);
            workers.abort_all();
        }

        let _ = adapter_handle.await;
        let _ = stats_handle.await;

        status.mark_stopped().await;
        self.gateway.close().await?;
        info!("Indexer stopped");
        Ok(())
    }
}

/// Stable partition routing. Account updates hash on the account key;
/// transactions hash on their first mentioned key so related events land
/// on the same worker as the account snapshots they explain.
fn partition_for(update: &RawUpdate, workers: usize) -> usize {
    let key = match update {
        RawUpdate::Account(snapshot) => snapshot.public_key.as_str(),
        RawUpdate::Transaction(record) => record
            .account_keys
            .first()
            .map(String::as_str)
            .unwrap_or(record.signature.as_str()),
    };
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use solwatch_common::types::AccountSnapshot;

    fn account(key: &str) -> RawUpdate {
        RawUpdate::Account(AccountSnapshot {
            public_key: key.into(),
            mint_address: "mint".into(),
            balance: Decimal::ZERO,
            slot: 1,
            block_time: None,
            transaction_signature: None,
        })
    }

    #[test]
    fn partition_is_stable_per_key() {
        let a = partition_for(&account("K1"), 4);
        for _ in 0..10 {
            assert_eq!(partition_for(&account("K1"), 4), a);
        }
    }

    #[test]
    fn partition_in_range() {
        for key in ["K1", "K2", "K3", "K4", "K5"] {
            assert!(partition_for(&account(key), 3) < 3);
        }
    }
}
