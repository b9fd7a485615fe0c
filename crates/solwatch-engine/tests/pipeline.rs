//! End-to-end pipeline test over the in-memory gateway: scripted stream
//! events in, classified event history and lifecycle status out.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::watch;

use solwatch_common::{
    config::DEFAULT_SWAP_PROGRAMS,
    types::{
        AccountSnapshot, BalanceChangeType, IndexerStatus, KeyFilter, RawUpdate,
        SubscriptionType, TransactionRecord, TransactionType, NATIVE_SOL_MINT,
    },
    Config,
};
use solwatch_engine::Indexer;
use solwatch_store::{Gateway, MemoryGateway, Page, SlotRange};
use solwatch_stream::{SourceConnection, UpdateSource};

const K1: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

enum Step {
    Deliver(RawUpdate),
    /// Keep the connection open without producing anything further.
    Hang,
}

struct ScriptedSource {
    connections: Mutex<VecDeque<Vec<Step>>>,
}

struct ScriptedConnection {
    steps: VecDeque<Step>,
}

#[async_trait]
impl SourceConnection for ScriptedConnection {
    async fn recv(&mut self) -> Result<Option<RawUpdate>> {
        match self.steps.pop_front() {
            Some(Step::Deliver(update)) => Ok(Some(update)),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(anyhow!("connection dropped")),
        }
    }

    async fn resubscribe(&mut self, _filters: &[KeyFilter]) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl UpdateSource for ScriptedSource {
    async fn connect(&self, _filters: &[KeyFilter]) -> Result<Box<dyn SourceConnection>> {
        match self.connections.lock().unwrap().pop_front() {
            Some(steps) => Ok(Box::new(ScriptedConnection { steps: steps.into() })),
            None => Err(anyhow!("connect refused")),
        }
    }
}

fn account(balance: u64, slot: u64) -> Step {
    Step::Deliver(RawUpdate::Account(AccountSnapshot {
        public_key: K1.into(),
        mint_address: NATIVE_SOL_MINT.into(),
        balance: Decimal::from(balance),
        slot,
        block_time: None,
        transaction_signature: None,
    }))
}

fn swap_transaction(signature: &str, slot: u64) -> Step {
    Step::Deliver(RawUpdate::Transaction(TransactionRecord {
        signature: signature.into(),
        slot,
        block_time: None,
        success: true,
        error_message: None,
        program_ids: vec![DEFAULT_SWAP_PROGRAMS[0].to_string()],
        log_messages: vec![],
        account_keys: vec![K1.into()],
    }))
}

fn test_config() -> Config {
    Config {
        database_url: "unused".into(),
        ws_endpoint: "ws://localhost:8900".into(),
        commitment: "confirmed".into(),
        key_refresh_secs: 60,
        worker_count: 2,
        queue_depth: 64,
        stats_interval_secs: 3600,
        max_reconnect_attempts: 5,
        max_backoff_secs: 1,
        shutdown_grace_secs: 5,
        swap_programs: DEFAULT_SWAP_PROGRAMS.iter().map(|s| s.to_string()).collect(),
    }
}

async fn run_pipeline(connections: Vec<Vec<Step>>, runtime: Duration) -> Arc<dyn Gateway> {
    let gateway: Arc<dyn Gateway> = Arc::new(MemoryGateway::new());
    let source = Arc::new(ScriptedSource { connections: Mutex::new(connections.into()) });

    let indexer = Indexer::new(test_config(), gateway.clone(), source)
        .await
        .unwrap();
    indexer
        .registry()
        .subscribe("U1", K1, SubscriptionType::Both)
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { indexer.run(shutdown_rx).await });

    tokio::time::sleep(runtime).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    gateway
}

#[tokio::test]
async fn swap_flow_yields_one_classified_delta() {
    let gateway = run_pipeline(
        vec![vec![
            account(100, 10),
            swap_transaction("SIG1", 11),
            account(150, 11),
            // Redelivery of the same snapshot must not produce a second row.
            account(150, 11),
            Step::Hang,
        ]],
        Duration::from_millis(500),
    )
    .await;

    let rows = gateway
        .balance_history(K1, SlotRange::default(), Page::default())
        .await
        .unwrap();
    let deltas: Vec<_> = rows
        .iter()
        .filter(|r| r.change_amount != Decimal::ZERO)
        .collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].change_amount, Decimal::from(50));
    assert_eq!(deltas[0].change_type, BalanceChangeType::SwapIn);
    assert_eq!(deltas[0].slot, 11);
    assert_eq!(deltas[0].transaction_signature.as_deref(), Some("SIG1"));

    let events = gateway
        .transaction_history(K1, SlotRange::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transaction_type, TransactionType::Swap);
    assert_eq!(events[0].user_id, "U1");
}

#[tokio::test]
async fn reconnect_gap_resets_the_baseline() {
    // The first connection drops after the initial snapshot; the second one
    // resumes far ahead. No delta may be fabricated across the gap.
    let gateway = run_pipeline(
        vec![
            vec![account(100, 10)],
            vec![account(400, 20), Step::Hang],
        ],
        Duration::from_secs(3),
    )
    .await;

    let rows = gateway
        .balance_history(K1, SlotRange::default(), Page::default())
        .await
        .unwrap();
    assert!(!rows.is_empty());
    assert!(
        rows.iter().all(|r| r.change_amount == Decimal::ZERO),
        "no delta row may span the gap: {:?}",
        rows
    );
    assert!(rows.iter().any(|r| r.slot == 20));

    let state = gateway.latest_state().await.unwrap();
    assert_eq!(state.last_processed_slot, 20);
}

#[tokio::test]
async fn lifecycle_ends_stopped_with_monotone_slot() {
    let gateway = run_pipeline(
        vec![vec![
            account(100, 30),
            account(90, 31),
            // Late arrival of an older slot must not move the slot cursor
            // backwards.
            account(80, 12),
            Step::Hang,
        ]],
        Duration::from_millis(500),
    )
    .await;

    let state = gateway.latest_state().await.unwrap();
    assert_eq!(state.status, IndexerStatus::Stopped);
    assert_eq!(state.last_processed_slot, 31);
    assert_eq!(state.total_subscriptions, 1);
}
