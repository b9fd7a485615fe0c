//! Correlates account snapshots with recently seen transactions.
//!
//! The pubsub feed delivers account snapshots without the signature of the
//! transaction that produced them. When a monitored key's transaction and
//! snapshot land at the same slot, the snapshot inherits the transaction's
//! signature and classification for the swap/transfer balance-change rules.

use {
    dashmap::DashMap,
    std::sync::atomic::{AtomicU64, Ordering},
    solwatch_common::types::{TransactionRecord, TransactionType},
};

/// How many slots behind the newest seen slot an entry survives.
const SLOT_HORIZON: u64 = 512;

pub struct TxnCorrelator {
    by_key_slot: DashMap<(String, u64), (String, TransactionType)>,
    by_signature: DashMap<String, (TransactionType, u64)>,
    latest_slot: AtomicU64,
}

impl TxnCorrelator {
    pub fn new() -> Self {
        Self {
            by_key_slot: DashMap::new(),
            by_signature: DashMap::new(),
            latest_slot: AtomicU64::new(0),
        }
    }

    pub fn remember(&self, record: &TransactionRecord, tx_type: TransactionType) {
        self.by_signature.insert(record.signature.clone(), (tx_type, record.slot));
        for key in &record.account_keys {
            self.by_key_slot
                .insert((key.clone(), record.slot), (record.signature.clone(), tx_type));
        }

        let latest = self.latest_slot.fetch_max(record.slot, Ordering::AcqRel).max(record.slot);
        if latest > SLOT_HORIZON {
            let cutoff = latest - SLOT_HORIZON;
            self.by_key_slot.retain(|(_, slot), _| *slot >= cutoff);
            self.by_signature.retain(|_, (_, slot)| *slot >= cutoff);
        }
    }

    /// Transaction seen for this (key, slot), if any.
    pub fn lookup(&self, public_key: &str, slot: u64) -> Option<(String, TransactionType)> {
        self.by_key_slot
            .get(&(public_key.to_string(), slot))
            .map(|e| e.clone())
    }

    /// Classification of a signature the snapshot itself carried.
    pub fn type_of(&self, signature: &str) -> Option<TransactionType> {
        self.by_signature.get(signature).map(|e| e.0)
    }
}

impl Default for TxnCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
