//! The reconciliation core: turns raw stream updates into classified,
//! idempotent event records.
//!
//! Workers drain per-partition queues; all updates for a given key land on
//! the same worker, so the read-modify-write against the balance cache is
//! serialized per key while unrelated keys proceed concurrently.

use {
    chrono::Utc,
    std::{sync::Arc, time::Duration, time::Instant},
    tokio::sync::mpsc,
    tracing::{debug, warn},
    uuid::Uuid,
    solwatch_common::types::{
        AccountSnapshot, BalanceUpdate, RawUpdate, TransactionEvent, TransactionRecord,
        TransactionType,
    },
    solwatch_store::Gateway,
    crate::{
        cache::{BalanceCache, Observed},
        classify::Classifier,
        correlate::TxnCorrelator,
        metrics::Metrics,
        registry::SubscriptionRegistry,
        status::StatusHandle,
    },
};

/// Backoff cap while a worker is stuck on a failing commit.
const COMMIT_RETRY_CAP: Duration = Duration::from_secs(30);

/// One queued update, stamped with the gap epoch current when the
/// dispatcher forwarded it. The stamp keeps snapshots that were already in
/// flight when a gap landed from being diffed against post-gap state.
pub struct QueuedUpdate {
    pub update: RawUpdate,
    pub epoch: u64,
}

/// Shared collaborators for all reconciliation workers.
pub struct ReconcileContext {
    pub gateway: Arc<dyn Gateway>,
    pub registry: Arc<SubscriptionRegistry>,
    pub cache: Arc<BalanceCache>,
    pub classifier: Arc<Classifier>,
    pub correlator: Arc<TxnCorrelator>,
    pub metrics: Arc<Metrics>,
    pub status: Arc<StatusHandle>,
}

pub struct ReconcileWorker {
    id: usize,
    ctx: Arc<ReconcileContext>,
}

impl ReconcileWorker {
    pub fn new(id: usize, ctx: Arc<ReconcileContext>) -> Self {
        Self { id, ctx }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<QueuedUpdate>) {
        while let Some(queued) = rx.recv().await {
            let started = Instant::now();
            match queued.update {
                RawUpdate::Account(snapshot) => self.handle_account(snapshot, queued.epoch).await,
                RawUpdate::Transaction(record) => self.handle_transaction(record).await,
            }
            self.ctx.metrics.record_latency(started.elapsed());
        }
        debug!("Reconcile worker {} drained", self.id);
    }

    pub(crate) async fn handle_account(&self, snapshot: AccountSnapshot, epoch: u64) {
        let Some(owner) = self.ctx.registry.account_owner(&snapshot.public_key).await else {
            return;
        };

        // The feed may attach the producing signature directly; otherwise a
        // transaction seen for the same (key, slot) is treated as associated.
        let (signature, linked) = match &snapshot.transaction_signature {
            Some(sig) => (Some(sig.clone()), self.ctx.correlator.type_of(sig)),
            None => match self.ctx.correlator.lookup(&snapshot.public_key, snapshot.slot) {
                Some((sig, tx_type)) => (Some(sig), Some(tx_type)),
                None => (None, None),
            },
        };

        let observed = self.ctx.cache.observe(
            epoch,
            &snapshot.public_key,
            &snapshot.mint_address,
            snapshot.balance,
            snapshot.slot,
        );

        let row = match observed {
            Observed::Unchanged => return,
            Observed::Stale => {
                debug!(
                    "Discarding pre-gap snapshot for {} at slot {}",
                    snapshot.public_key, snapshot.slot
                );
                return;
            }
            Observed::Baseline => {
                // Persisted so the cache can be rebuilt after a restart
                // without losing the baseline.
                self.ctx.metrics.baselines_recorded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                BalanceUpdate::baseline(
                    owner,
                    snapshot.public_key.clone(),
                    snapshot.mint_address.clone(),
                    snapshot.balance,
                    snapshot.slot as i64,
                    snapshot.block_time,
                )
            }
            Observed::Delta { old, applied } => {
                let change = snapshot.balance - old;
                let change_type = self.ctx.classifier.classify_balance_change(change, linked);
                if !applied {
                    debug!(
                        "Out-of-order snapshot for {} at slot {}, recording history only",
                        snapshot.public_key, snapshot.slot
                    );
                }
                BalanceUpdate::new(
                    owner,
                    snapshot.public_key.clone(),
                    snapshot.mint_address.clone(),
                    old,
                    snapshot.balance,
                    change_type,
                    signature,
                    snapshot.slot as i64,
                    snapshot.block_time,
                )
            }
        };

        self.commit_balance(&row).await;
    }

    pub(crate) async fn handle_transaction(&self, record: TransactionRecord) {
        let tx_type = self.ctx.classifier.classify_transaction(&record);
        self.ctx.correlator.remember(&record, tx_type);

        for key in &record.account_keys {
            let Some(owner) = self.ctx.registry.transaction_owner(key).await else {
                continue;
            };
            let event = build_event(&record, tx_type, owner, key.clone());
            self.commit_transaction(&event).await;
        }
    }

    /// Commit with one immediate retry; repeated failure escalates the
    /// indexer to `error` and blocks this partition (and only this
    /// partition) until the commit lands. Nothing is dropped silently.
    async fn commit_balance(&self, row: &BalanceUpdate) {
        let mut attempt: u32 = 0;
        loop {
            match self.ctx.gateway.commit_balance_update(row).await {
                Ok(inserted) => {
                    if inserted {
                        self.ctx
                            .metrics
                            .balance_updates
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    } else {
                        self.ctx
                            .metrics
                            .duplicates_skipped
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    self.ctx.status.mark_running().await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    self.on_commit_failure(attempt, &e).await;
                }
            }
        }
    }

    async fn commit_transaction(&self, event: &TransactionEvent) {
        let mut attempt: u32 = 0;
        loop {
            match self.ctx.gateway.commit_transaction_event(event).await {
                Ok(inserted) => {
                    if inserted {
                        self.ctx
                            .metrics
                            .transaction_events
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    } else {
                        self.ctx
                            .metrics
                            .duplicates_skipped
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    self.ctx.status.mark_running().await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    self.on_commit_failure(attempt, &e).await;
                }
            }
        }
    }

    async fn on_commit_failure(&self, attempt: u32, error: &anyhow::Error) {
        self.ctx.metrics.record_error();
        warn!("Commit failed on worker {} (attempt {}): {}", self.id, attempt, error);

        if attempt == 1 {
            // One quick retry before escalating.
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }

        self.ctx.status.mark_error().await;
        let delay = Duration::from_secs(1)
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2).min(16)))
            .min(COMMIT_RETRY_CAP);
        tokio::time::sleep(delay).await;
    }
}

fn build_event(
    record: &TransactionRecord,
    tx_type: TransactionType,
    owner: String,
    public_key: String,
) -> TransactionEvent {
    TransactionEvent {
        id: Uuid::new_v4().to_string(),
        user_id: owner,
        public_key,
        transaction_signature: record.signature.clone(),
        transaction_type: tx_type,
        slot: record.slot as i64,
        block_time: record.block_time,
        success: record.success,
        error_message: record.error_message.clone(),
        program_ids: serde_json::json!(record.program_ids),
        created_at: Utc::now(),
    }
}
