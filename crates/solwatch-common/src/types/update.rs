//! Normalized updates produced by the stream adapter.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::SubscriptionType;

/// A point-in-time balance observation for one (key, mint) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub public_key: String,
    pub mint_address: String,
    pub balance: Decimal,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    /// Signature of the transaction that produced this snapshot, when the
    /// upstream feed provides one.
    pub transaction_signature: Option<String>,
}

/// A confirmed transaction touching at least one monitored key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Program ids invoked by the transaction, base58.
    pub program_ids: Vec<String>,
    /// Raw log lines, used for instruction-level classification.
    pub log_messages: Vec<String>,
    /// Account keys the transaction touches.
    pub account_keys: Vec<String>,
}

/// One normalized event off the upstream ledger feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawUpdate {
    Account(AccountSnapshot),
    Transaction(TransactionRecord),
}

impl RawUpdate {
    pub fn slot(&self) -> u64 {
        match self {
            RawUpdate::Account(snapshot) => snapshot.slot,
            RawUpdate::Transaction(record) => record.slot,
        }
    }
}

/// What the stream adapter feeds into the reconciliation queue.
///
/// `Gap` means continuity with the previous delivery was lost and cached
/// balances must not be diffed against post-gap snapshots. `Offline` means
/// the reconnect budget is exhausted; retries continue in the background.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Update(RawUpdate),
    Gap,
    Offline,
}

/// Subscription filter handed to an upstream source connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    pub public_key: String,
    pub kind: SubscriptionType,
}

impl KeyFilter {
    pub fn account_keys(filters: &[KeyFilter]) -> Vec<&str> {
        filters
            .iter()
            .filter(|f| f.kind.wants_accounts())
            .map(|f| f.public_key.as_str())
            .collect()
    }

    pub fn transaction_keys(filters: &[KeyFilter]) -> Vec<&str> {
        filters
            .iter()
            .filter(|f| f.kind.wants_transactions())
            .map(|f| f.public_key.as_str())
            .collect()
    }
}
