//! In-memory gateway used by tests and local development. Enforces the same
//! uniqueness rules as the Postgres schema.

use {
    anyhow::{anyhow, Result},
    async_trait::async_trait,
    chrono::Utc,
    std::collections::{HashMap, HashSet},
    tokio::sync::Mutex,
    solwatch_common::types::{
        BalanceUpdate, IndexerState, IndexerStats, IndexerStatus, SubscribedKey, TransactionEvent,
    },
    crate::traits::{CachedBalanceRow, Gateway, Page, SlotRange},
};

#[derive(Default)]
struct Inner {
    state: Option<IndexerState>,
    subscriptions: Vec<SubscribedKey>,
    balance_updates: Vec<BalanceUpdate>,
    balance_dedupe: HashSet<(String, String, i64, String)>,
    transaction_events: Vec<TransactionEvent>,
    transaction_dedupe: HashSet<(String, String)>,
    stats: Vec<IndexerStats>,
}

impl Inner {
    fn state_mut(&mut self) -> Result<&mut IndexerState> {
        self.state.as_mut().ok_or_else(|| anyhow!("gateway not initialized"))
    }
}

pub struct MemoryGateway {
    inner: Mutex<Inner>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_none() {
            inner.state = Some(IndexerState::new());
        }
        Ok(())
    }

    async fn upsert_subscription(&self, key: &SubscribedKey) -> Result<SubscribedKey> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.user_id == key.user_id && s.public_key == key.public_key)
        {
            existing.is_active = true;
            existing.subscription_type = key.subscription_type;
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }

        inner.subscriptions.push(key.clone());
        Ok(key.clone())
    }

    async fn deactivate_subscription(&self, user_id: &str, public_key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner
            .subscriptions
            .iter_mut()
            .find(|s| s.user_id == user_id && s.public_key == public_key && s.is_active)
        {
            Some(sub) => {
                sub.is_active = false;
                sub.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_subscriptions(&self) -> Result<Vec<SubscribedKey>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.iter().filter(|s| s.is_active).cloned().collect())
    }

    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<SubscribedKey>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.iter().filter(|s| s.user_id == user_id).cloned().collect())
    }

    async fn commit_balance_update(&self, update: &BalanceUpdate) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let dedupe = (
            update.public_key.clone(),
            update.mint_address.clone(),
            update.slot,
            update.transaction_signature.clone().unwrap_or_default(),
        );
        if !inner.balance_dedupe.insert(dedupe) {
            return Ok(false);
        }

        inner.balance_updates.push(update.clone());
        let slot = update.slot;
        let state = inner.state_mut()?;
        state.last_processed_slot = state.last_processed_slot.max(slot);
        state.updated_at = Utc::now();
        Ok(true)
    }

    async fn commit_transaction_event(&self, event: &TransactionEvent) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let dedupe = (event.transaction_signature.clone(), event.public_key.clone());
        if !inner.transaction_dedupe.insert(dedupe) {
            return Ok(false);
        }

        inner.transaction_events.push(event.clone());
        let slot = event.slot;
        let state = inner.state_mut()?;
        state.last_processed_slot = state.last_processed_slot.max(slot);
        state.updated_at = Utc::now();
        Ok(true)
    }

    async fn load_latest_balances(&self) -> Result<Vec<CachedBalanceRow>> {
        let inner = self.inner.lock().await;
        let mut latest: HashMap<(String, String), CachedBalanceRow> = HashMap::new();
        for update in &inner.balance_updates {
            let key = (update.public_key.clone(), update.mint_address.clone());
            let replace = latest.get(&key).map_or(true, |row| update.slot >= row.slot);
            if replace {
                latest.insert(
                    key,
                    CachedBalanceRow {
                        public_key: update.public_key.clone(),
                        mint_address: update.mint_address.clone(),
                        balance: update.new_balance,
                        slot: update.slot,
                    },
                );
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn balance_history(
        &self,
        public_key: &str,
        range: SlotRange,
        page: Page,
    ) -> Result<Vec<BalanceUpdate>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .balance_updates
            .iter()
            .filter(|u| u.public_key == public_key && range.contains(u.slot))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.slot.cmp(&a.slot).then(b.processed_at.cmp(&a.processed_at)));
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn transaction_history(
        &self,
        public_key: &str,
        range: SlotRange,
        page: Page,
    ) -> Result<Vec<TransactionEvent>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .transaction_events
            .iter()
            .filter(|e| e.public_key == public_key && range.contains(e.slot))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.slot.cmp(&a.slot).then(b.created_at.cmp(&a.created_at)));
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn latest_state(&self) -> Result<IndexerState> {
        let inner = self.inner.lock().await;
        inner.state.clone().ok_or_else(|| anyhow!("gateway not initialized"))
    }

    async fn set_status(&self, status: IndexerStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.state_mut()?;
        state.status = status;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn sync_subscription_state(&self, active_keys: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let snapshot = serde_json::json!(active_keys);
        let count = active_keys.len() as i32;
        let state = inner.state_mut()?;
        state.subscribed_keys = snapshot;
        state.total_subscriptions = count;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn record_stats(&self, stats: &IndexerStats) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.stats.push(stats.clone());
        Ok(())
    }

    async fn count_balance_updates(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.balance_updates.len() as i64)
    }

    async fn count_transaction_events(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.transaction_events.len() as i64)
    }

    async fn count_active_keys(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.iter().filter(|s| s.is_active).count() as i64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
