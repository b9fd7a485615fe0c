//! Subscription registry: the sole writer of `subscribed_keys`.
//!
//! Keeps an in-memory view of the active key set for fast, lock-light
//! snapshots; the durable truth lives in the store. Every mutation refreshes
//! the denormalized key snapshot and subscription count on the state row.

use {
    async_trait::async_trait,
    std::{collections::HashMap, sync::Arc},
    tokio::sync::RwLock,
    tracing::{info, warn},
    solwatch_common::{
        types::{KeyFilter, SubscribedKey, SubscriptionType},
        Error,
    },
    solwatch_store::Gateway,
    solwatch_stream::KeySource,
};

#[derive(Debug, Clone)]
struct ActiveKey {
    /// Union of subscription kinds across all owners of this key.
    kind: SubscriptionType,
    /// Owners in subscription order; the first is the attribution owner for
    /// emitted events.
    owners: Vec<String>,
}

pub struct SubscriptionRegistry {
    gateway: Arc<dyn Gateway>,
    active: RwLock<HashMap<String, ActiveKey>>,
}

impl SubscriptionRegistry {
    pub async fn new(gateway: Arc<dyn Gateway>) -> Result<Arc<Self>, Error> {
        let registry = Arc::new(Self { gateway, active: RwLock::new(HashMap::new()) });
        registry.refresh().await?;
        info!("Subscription registry initialized with {} active keys", registry.active.read().await.len());
        Ok(registry)
    }

    /// Subscribe a key for an owner. Idempotent: an existing (owner, key)
    /// row is reactivated on the same row, with its kind updated.
    pub async fn subscribe(
        &self,
        user_id: &str,
        public_key: &str,
        kind: SubscriptionType,
    ) -> Result<SubscribedKey, Error> {
        validate_public_key(public_key)?;

        let key = SubscribedKey::new(user_id.to_string(), public_key.to_string(), kind);
        let row = self
            .gateway
            .upsert_subscription(&key)
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        info!("Subscribed key {} for user {} ({:?})", public_key, user_id, kind);
        self.refresh().await?;
        Ok(row)
    }

    /// Deactivate a subscription. Absent or already-inactive pairs are a
    /// no-op, not an error.
    pub async fn unsubscribe(&self, user_id: &str, public_key: &str) -> Result<(), Error> {
        let removed = self
            .gateway
            .deactivate_subscription(user_id, public_key)
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        if removed {
            info!("Unsubscribed key {} for user {}", public_key, user_id);
            self.refresh().await?;
        } else {
            warn!("Unsubscribe for inactive key {} (user {}), nothing to do", public_key, user_id);
        }

        Ok(())
    }

    /// Copy-on-read snapshot of the active key set.
    pub async fn active_keys(&self) -> Vec<(String, SubscriptionType)> {
        let active = self.active.read().await;
        active.iter().map(|(key, entry)| (key.clone(), entry.kind)).collect()
    }

    /// The owner events for this key are attributed to, when any owner's
    /// subscription covers account monitoring.
    pub async fn account_owner(&self, public_key: &str) -> Option<String> {
        let active = self.active.read().await;
        let entry = active.get(public_key)?;
        if !entry.kind.wants_accounts() {
            return None;
        }
        entry.owners.first().cloned()
    }

    /// The owner transaction events for this key are attributed to.
    pub async fn transaction_owner(&self, public_key: &str) -> Option<String> {
        let active = self.active.read().await;
        let entry = active.get(public_key)?;
        if !entry.kind.wants_transactions() {
            return None;
        }
        entry.owners.first().cloned()
    }

    pub async fn is_monitored(&self, public_key: &str) -> bool {
        self.active.read().await.contains_key(public_key)
    }

    /// Rebuild the in-memory view from the store and push the denormalized
    /// snapshot onto the state row.
    pub async fn refresh(&self) -> Result<(), Error> {
        let subscriptions = self
            .gateway
            .active_subscriptions()
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        let mut rebuilt: HashMap<String, ActiveKey> = HashMap::new();
        for sub in &subscriptions {
            rebuilt
                .entry(sub.public_key.clone())
                .and_modify(|entry| {
                    entry.kind = merge_kinds(entry.kind, sub.subscription_type);
                    entry.owners.push(sub.user_id.clone());
                })
                .or_insert_with(|| ActiveKey {
                    kind: sub.subscription_type,
                    owners: vec![sub.user_id.clone()],
                });
        }

        let mut keys: Vec<String> = rebuilt.keys().cloned().collect();
        keys.sort();

        {
            let mut active = self.active.write().await;
            *active = rebuilt;
        }

        self.gateway
            .sync_subscription_state(&keys)
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl KeySource for SubscriptionRegistry {
    async fn active_filters(&self) -> Vec<KeyFilter> {
        let mut filters: Vec<KeyFilter> = self
            .active_keys()
            .await
            .into_iter()
            .map(|(public_key, kind)| KeyFilter { public_key, kind })
            .collect();
        filters.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        filters
    }
}

fn merge_kinds(a: SubscriptionType, b: SubscriptionType) -> SubscriptionType {
    if a == b {
        return a;
    }
    // Any two distinct kinds cover both accounts and transactions.
    SubscriptionType::Both
}

/// Solana addresses are base58 and decode to exactly 32 bytes.
fn validate_public_key(public_key: &str) -> Result<(), Error> {
    if public_key.len() < 32 || public_key.len() > 44 {
        return Err(Error::InvalidKey(format!(
            "{}: expected 32-44 base58 characters, got {}",
            public_key,
            public_key.len()
        )));
    }

    match bs58::decode(public_key).into_vec() {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        Ok(bytes) => Err(Error::InvalidKey(format!(
            "{}: decoded to {} bytes, expected 32",
            public_key,
            bytes.len()
        ))),
        Err(_) => Err(Error::InvalidKey(format!("{}: not valid base58", public_key))),
    }
}
