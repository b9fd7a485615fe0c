//! Reconnecting driver between an upstream source and the reconciliation
//! queue.
//!
//! The adapter owns the retry policy: exponential backoff with a bounded
//! maximum, a `Gap` signal after every reconnect (the pubsub feed has no
//! replay, so continuity is never assumed across connections), and an
//! `Offline` signal once the reconnect budget is exhausted. Retries continue
//! past the budget at the capped interval.

use {
    crate::source::{KeySource, SourceConnection, UpdateSource},
    anyhow::Result,
    rand::Rng,
    std::{sync::Arc, time::Duration},
    tokio::sync::{mpsc, watch},
    tracing::{error, info, warn},
    solwatch_common::types::{KeyFilter, StreamEvent},
};

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// How often the active key set is re-checked against the registry.
    pub key_refresh: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            key_refresh: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
            max_reconnect_attempts: 10,
        }
    }
}

/// Backoff for the nth consecutive failed attempt (1-based), capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(cap)
}

pub struct StreamAdapter {
    source: Arc<dyn UpdateSource>,
    keys: Arc<dyn KeySource>,
    config: AdapterConfig,
}

impl StreamAdapter {
    pub fn new(source: Arc<dyn UpdateSource>, keys: Arc<dyn KeySource>, config: AdapterConfig) -> Self {
        Self { source, keys, config }
    }

    /// Run until shutdown. Events flow into `tx`; the queue is bounded, so a
    /// slow consumer applies backpressure to the stream.
    pub async fn run(
        &self,
        tx: mpsc::Sender<StreamEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut attempts: u32 = 0;
        let mut connected_before = false;
        let mut offline_reported = false;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let filters = self.keys.active_filters().await;
            if filters.is_empty() {
                info!("No active keys to monitor, waiting for subscriptions");
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = tokio::time::sleep(self.config.key_refresh) => continue,
                }
            }

            match self.source.connect(&filters).await {
                Ok(mut conn) => {
                    info!("Stream connected, monitoring {} keys", filters.len());
                    attempts = 0;
                    offline_reported = false;

                    if connected_before {
                        // Updates may have been missed while disconnected;
                        // cached balances must not be diffed across the gap.
                        if tx.send(StreamEvent::Gap).await.is_err() {
                            return Ok(());
                        }
                    }
                    connected_before = true;

                    self.pump(&mut *conn, filters, &tx, &mut shutdown).await?;

                    if *shutdown.borrow() {
                        conn.close().await;
                        return Ok(());
                    }
                }
                Err(e) => {
                    attempts += 1;
                    warn!("Stream connect failed (attempt {}): {}", attempts, e);

                    if attempts >= self.config.max_reconnect_attempts && !offline_reported {
                        error!(
                            "Reconnect budget of {} attempts exhausted, continuing at capped interval",
                            self.config.max_reconnect_attempts
                        );
                        offline_reported = true;
                        if tx.send(StreamEvent::Offline).await.is_err() {
                            return Ok(());
                        }
                    }

                    let delay = backoff_delay(
                        attempts,
                        self.config.base_backoff,
                        self.config.max_backoff,
                    ) + jitter();
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Forward updates from one connection until it drops, the key set check
    /// fails to apply, or shutdown is signalled.
    async fn pump(
        &self,
        conn: &mut dyn SourceConnection,
        mut filters: Vec<KeyFilter>,
        tx: &mpsc::Sender<StreamEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut refresh = tokio::time::interval(self.config.key_refresh);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    conn.close().await;
                    return Ok(());
                }
                _ = refresh.tick() => {
                    let latest = self.keys.active_filters().await;
                    if latest != filters {
                        info!("Active key set changed ({} keys), resubscribing", latest.len());
                        if let Err(e) = conn.resubscribe(&latest).await {
                            warn!("Resubscribe failed, reconnecting: {}", e);
                            return Ok(());
                        }
                        filters = latest;
                    }
                }
                received = conn.recv() => match received {
                    Ok(Some(update)) => {
                        if tx.send(StreamEvent::Update(update)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        warn!("Stream ended, reconnecting");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("Stream error, reconnecting: {}", e);
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use solwatch_common::types::{AccountSnapshot, RawUpdate, SubscriptionType, NATIVE_SOL_MINT};

    fn snapshot(slot: u64) -> RawUpdate {
        RawUpdate::Account(AccountSnapshot {
            public_key: "K1".into(),
            mint_address: NATIVE_SOL_MINT.into(),
            balance: Decimal::from(100),
            slot,
            block_time: None,
            transaction_signature: None,
        })
    }

    enum Script {
        Fail,
        Deliver(Vec<RawUpdate>),
    }

    struct ScriptedSource {
        scripts: Mutex<VecDeque<Script>>,
    }

    struct ScriptedConnection {
        updates: VecDeque<RawUpdate>,
    }

    #[async_trait]
    impl SourceConnection for ScriptedConnection {
        async fn recv(&mut self) -> Result<Option<RawUpdate>> {
            match self.updates.pop_front() {
                Some(update) => Ok(Some(update)),
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
            match self.scripts.lock().unwrap().pop_front() {
                Some(Script::Deliver(updates)) => Ok(Box::new(ScriptedConnection {
                    updates: updates.into(),
                })),
                Some(Script::Fail) | None => Err(anyhow!("connect refused")),
            }
        }
    }

    struct OneKey;

    #[async_trait]
    impl KeySource for OneKey {
        async fn active_filters(&self) -> Vec<KeyFilter> {
            vec![KeyFilter { public_key: "K1".into(), kind: SubscriptionType::Both }]
        }
    }

    fn test_config(max_attempts: u32) -> AdapterConfig {
        AdapterConfig {
            key_refresh: Duration::from_secs(60),
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_reconnect_attempts: max_attempts,
        }
    }

    async fn collect_events(scripts: Vec<Script>, max_attempts: u32, want: usize) -> Vec<StreamEvent> {
        let source = Arc::new(ScriptedSource { scripts: Mutex::new(scripts.into()) });
        let adapter = StreamAdapter::new(source, Arc::new(OneKey), test_config(max_attempts));

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { adapter.run(tx, shutdown_rx).await });

        let mut events = Vec::new();
        while events.len() < want {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for stream event")
                .expect("adapter hung up early");
            events.push(event);
        }

        shutdown_tx.send(true).unwrap();
        drop(rx);
        let _ = handle.await;
        events
    }

    #[tokio::test]
    async fn gap_emitted_after_reconnect_but_not_first_connect() {
        let events = collect_events(
            vec![
                Script::Deliver(vec![snapshot(10)]),
                Script::Fail,
                Script::Deliver(vec![snapshot(12)]),
            ],
            10,
            3,
        )
        .await;

        assert!(matches!(&events[0], StreamEvent::Update(u) if u.slot() == 10));
        assert!(matches!(events[1], StreamEvent::Gap));
        assert!(matches!(&events[2], StreamEvent::Update(u) if u.slot() == 12));
    }

    #[tokio::test]
    async fn offline_reported_after_budget_exhausted() {
        let scripts = vec![Script::Fail, Script::Fail, Script::Fail, Script::Fail];
        let events = collect_events(scripts, 3, 1).await;
        assert!(matches!(events[0], StreamEvent::Offline));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(64);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(16));
        assert_eq!(backoff_delay(12, base, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, base, cap), cap);
    }
}
