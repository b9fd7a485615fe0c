//! Common data types used throughout the solwatch system

pub mod event;
pub mod update;

pub use event::{
    BalanceChangeType, BalanceUpdate, IndexerState, IndexerStats, IndexerStatus, SubscribedKey,
    SubscriptionType, TransactionEvent, TransactionType, PRIMARY_STATE_ID,
};
pub use update::{AccountSnapshot, KeyFilter, RawUpdate, StreamEvent, TransactionRecord};

/// Mint address used for native SOL balances.
pub const NATIVE_SOL_MINT: &str = "11111111111111111111111111111112";
