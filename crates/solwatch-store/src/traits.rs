use {
    anyhow::Result,
    async_trait::async_trait,
    rust_decimal::Decimal,
    solwatch_common::types::{
        BalanceUpdate, IndexerState, IndexerStats, IndexerStatus, SubscribedKey, TransactionEvent,
    },
};

/// Slot-range filter for history reads. `None` bounds are open.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl SlotRange {
    pub fn contains(&self, slot: i64) -> bool {
        self.from.map_or(true, |from| slot >= from) && self.to.map_or(true, |to| slot <= to)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 100, offset: 0 }
    }
}

/// Last-known balance of one (key, mint) pair, recovered from event history.
#[derive(Debug, Clone)]
pub struct CachedBalanceRow {
    pub public_key: String,
    pub mint_address: String,
    pub balance: Decimal,
    pub slot: i64,
}

/// A trait representing the durable storage capabilities required by the
/// indexer. This abstraction allows for pluggable storage backends.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Create schema if needed and seed the singleton state row.
    async fn initialize(&self) -> Result<()>;

    /// Insert or reactivate a (user, key) subscription on the same row.
    async fn upsert_subscription(&self, key: &SubscribedKey) -> Result<SubscribedKey>;

    /// Mark a subscription inactive. Returns false if no row changed.
    async fn deactivate_subscription(&self, user_id: &str, public_key: &str) -> Result<bool>;

    /// All currently active subscriptions.
    async fn active_subscriptions(&self) -> Result<Vec<SubscribedKey>>;

    /// All subscriptions (active or not) for one user.
    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<SubscribedKey>>;

    /// Atomically insert a balance event and advance `last_processed_slot`.
    /// Returns false when the event was a duplicate delivery.
    async fn commit_balance_update(&self, update: &BalanceUpdate) -> Result<bool>;

    /// Atomically insert a transaction event and advance `last_processed_slot`.
    /// Returns false when the (signature, key) pair already exists.
    async fn commit_transaction_event(&self, event: &TransactionEvent) -> Result<bool>;

    /// Highest-slot balance per (key, mint), for cache recovery at startup.
    async fn load_latest_balances(&self) -> Result<Vec<CachedBalanceRow>>;

    /// Balance event history for one key, newest slot first.
    async fn balance_history(
        &self,
        public_key: &str,
        range: SlotRange,
        page: Page,
    ) -> Result<Vec<BalanceUpdate>>;

    /// Transaction event history for one key, newest slot first.
    async fn transaction_history(
        &self,
        public_key: &str,
        range: SlotRange,
        page: Page,
    ) -> Result<Vec<TransactionEvent>>;

    /// Fetch the singleton state row.
    async fn latest_state(&self) -> Result<IndexerState>;

    /// Transition the lifecycle status of the singleton state row.
    async fn set_status(&self, status: IndexerStatus) -> Result<()>;

    /// Refresh the denormalized key snapshot and subscription count.
    async fn sync_subscription_state(&self, active_keys: &[String]) -> Result<()>;

    /// Append one stats snapshot.
    async fn record_stats(&self, stats: &IndexerStats) -> Result<()>;

    async fn count_balance_updates(&self) -> Result<i64>;

    async fn count_transaction_events(&self) -> Result<i64>;

    async fn count_active_keys(&self) -> Result<i64>;

    /// Close the storage (flush pending writes, close connections).
    async fn close(&self) -> Result<()>;
}
