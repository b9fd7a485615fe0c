//! Persisted entities: indexer state, subscriptions, and the immutable
//! balance/transaction event history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Singleton record tracking the lifecycle of one indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IndexerState {
    pub id: String,
    /// Denormalized snapshot of the subscribed key set, as a JSON array.
    pub subscribed_keys: serde_json::Value,
    pub last_processed_slot: i64,
    pub status: IndexerStatus,
    pub total_subscriptions: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row id of the singleton `indexer_states` record.
pub const PRIMARY_STATE_ID: &str = "primary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "indexer_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IndexerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

/// A (owner, public key) monitoring directive.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscribedKey {
    pub id: String,
    pub user_id: String,
    pub public_key: String,
    pub is_active: bool,
    pub subscription_type: SubscriptionType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Monitor account balance changes only.
    Account,
    /// Monitor transactions involving this key only.
    Transaction,
    /// Monitor both.
    Both,
}

impl SubscriptionType {
    pub fn wants_accounts(&self) -> bool {
        matches!(self, Self::Account | Self::Both)
    }

    pub fn wants_transactions(&self) -> bool {
        matches!(self, Self::Transaction | Self::Both)
    }
}

/// Immutable balance transition record for one (key, mint) pair at one slot.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceUpdate {
    pub id: String,
    pub user_id: String,
    pub public_key: String,
    pub mint_address: String,
    pub old_balance: Decimal,
    pub new_balance: Decimal,
    pub change_amount: Decimal,
    pub change_type: BalanceChangeType,
    pub transaction_signature: Option<String>,
    pub slot: i64,
    pub block_time: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "balance_change_type", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum BalanceChangeType {
    Increase,
    Decrease,
    SwapIn,
    SwapOut,
    Transfer,
    Unknown,
}

/// Immutable classified transaction record, one per (signature, monitored key).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransactionEvent {
    pub id: String,
    pub user_id: String,
    pub public_key: String,
    pub transaction_signature: String,
    pub transaction_type: TransactionType,
    pub slot: i64,
    pub block_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
    /// JSON array of program ids invoked by the transaction.
    pub program_ids: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum TransactionType {
    Transfer,
    Swap,
    Stake,
    Vote,
    CreateAccount,
    CloseAccount,
    Other,
}

/// Periodic monitoring snapshot, append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IndexerStats {
    pub id: String,
    pub total_keys_monitored: i32,
    pub total_balance_updates: i64,
    pub total_transactions: i64,
    pub last_processed_slot: i64,
    pub avg_processing_time_ms: f64,
    pub errors_last_hour: i32,
    pub uptime_seconds: i64,
    pub recorded_at: DateTime<Utc>,
}

impl IndexerState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: PRIMARY_STATE_ID.to_string(),
            subscribed_keys: serde_json::json!([]),
            last_processed_slot: 0,
            status: IndexerStatus::Starting,
            total_subscriptions: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for IndexerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscribedKey {
    pub fn new(user_id: String, public_key: String, subscription_type: SubscriptionType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            public_key,
            is_active: true,
            subscription_type,
            created_at: now,
            updated_at: now,
        }
    }
}

impl BalanceUpdate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        public_key: String,
        mint_address: String,
        old_balance: Decimal,
        new_balance: Decimal,
        change_type: BalanceChangeType,
        transaction_signature: Option<String>,
        slot: i64,
        block_time: Option<DateTime<Utc>>,
    ) -> Self {
        let change_amount = new_balance - old_balance;
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            public_key,
            mint_address,
            old_balance,
            new_balance,
            change_amount,
            change_type,
            transaction_signature,
            slot,
            block_time,
            processed_at: Utc::now(),
        }
    }

    /// First observation of a (key, mint) pair: nothing to diff against, so
    /// the row records the observed balance with a zero change.
    pub fn baseline(
        user_id: String,
        public_key: String,
        mint_address: String,
        balance: Decimal,
        slot: i64,
        block_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self::new(
            user_id,
            public_key,
            mint_address,
            balance,
            balance,
            BalanceChangeType::Unknown,
            None,
            slot,
            block_time,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_amount_is_exact_difference() {
        let update = BalanceUpdate::new(
            "u1".into(),
            "key".into(),
            crate::types::NATIVE_SOL_MINT.into(),
            Decimal::from(100),
            Decimal::from(150),
            BalanceChangeType::Increase,
            None,
            11,
            None,
        );
        assert_eq!(update.change_amount, Decimal::from(50));

        let down = BalanceUpdate::new(
            "u1".into(),
            "key".into(),
            crate::types::NATIVE_SOL_MINT.into(),
            Decimal::from(150),
            Decimal::from(30),
            BalanceChangeType::Decrease,
            None,
            12,
            None,
        );
        assert_eq!(down.change_amount, Decimal::from(-120));
    }

    #[test]
    fn baseline_has_zero_change_and_unknown_type() {
        let row = BalanceUpdate::baseline(
            "u1".into(),
            "key".into(),
            crate::types::NATIVE_SOL_MINT.into(),
            Decimal::from(100),
            10,
            None,
        );
        assert_eq!(row.change_amount, Decimal::ZERO);
        assert_eq!(row.old_balance, row.new_balance);
        assert_eq!(row.change_type, BalanceChangeType::Unknown);
    }

    #[test]
    fn subscription_kind_filters() {
        assert!(SubscriptionType::Both.wants_accounts());
        assert!(SubscriptionType::Both.wants_transactions());
        assert!(SubscriptionType::Account.wants_accounts());
        assert!(!SubscriptionType::Account.wants_transactions());
        assert!(!SubscriptionType::Transaction.wants_accounts());
        assert!(SubscriptionType::Transaction.wants_transactions());
    }
}
