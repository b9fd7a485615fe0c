//! Solana websocket pubsub source.
//!
//! Speaks the JSON-RPC pubsub protocol: `accountSubscribe` (jsonParsed
//! encoding) for balance snapshots and `logsSubscribe` mentions for
//! transactions touching monitored keys.

use {
    crate::source::{SourceConnection, UpdateSource},
    anyhow::{anyhow, Result},
    async_trait::async_trait,
    futures_util::{SinkExt, StreamExt},
    rust_decimal::Decimal,
    serde_json::{json, Value},
    std::collections::HashMap,
    std::str::FromStr,
    tokio::net::TcpStream,
    tokio_tungstenite::{
        connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
    },
    tracing::{debug, warn},
    solwatch_common::types::{
        AccountSnapshot, KeyFilter, RawUpdate, TransactionRecord, NATIVE_SOL_MINT,
    },
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubKind {
    Account,
    Logs,
}

pub struct PubsubSource {
    endpoint: String,
    commitment: String,
}

impl PubsubSource {
    pub fn new(endpoint: impl Into<String>, commitment: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), commitment: commitment.into() }
    }
}

#[async_trait]
impl UpdateSource for PubsubSource {
    async fn connect(&self, filters: &[KeyFilter]) -> Result<Box<dyn SourceConnection>> {
        tracing::info!("Connecting to pubsub endpoint {}", self.endpoint);

        let (ws, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| anyhow!("websocket connect failed: {}", e))?;

        let mut conn = PubsubConnection {
            ws,
            commitment: self.commitment.clone(),
            next_id: 1,
            pending: HashMap::new(),
            subs: HashMap::new(),
            sub_ids: HashMap::new(),
        };
        conn.subscribe_all(filters).await?;

        Ok(Box::new(conn))
    }
}

struct PubsubConnection {
    ws: WsStream,
    commitment: String,
    next_id: u64,
    /// request id -> (key, kind), awaiting the subscription id.
    pending: HashMap<u64, (String, SubKind)>,
    /// subscription id -> (key, kind).
    subs: HashMap<u64, (String, SubKind)>,
    /// (key, kind) -> subscription id, for unsubscribes.
    sub_ids: HashMap<(String, SubKind), u64>,
}

impl PubsubConnection {
    async fn send_request(&mut self, method: &str, params: Value) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.ws
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| anyhow!("websocket send failed: {}", e))?;
        Ok(id)
    }

    async fn subscribe_key(&mut self, key: &str, kind: SubKind) -> Result<()> {
        let id = match kind {
            SubKind::Account => {
                self.send_request(
                    "accountSubscribe",
                    json!([key, {"encoding": "jsonParsed", "commitment": self.commitment}]),
                )
                .await?
            }
            SubKind::Logs => {
                self.send_request(
                    "logsSubscribe",
                    json!([{"mentions": [key]}, {"commitment": self.commitment}]),
                )
                .await?
            }
        };
        self.pending.insert(id, (key.to_string(), kind));
        Ok(())
    }

    async fn unsubscribe(&mut self, key: &str, kind: SubKind) -> Result<()> {
        if let Some(sub_id) = self.sub_ids.remove(&(key.to_string(), kind)) {
            self.subs.remove(&sub_id);
            let method = match kind {
                SubKind::Account => "accountUnsubscribe",
                SubKind::Logs => "logsUnsubscribe",
            };
            self.send_request(method, json!([sub_id])).await?;
        }
        Ok(())
    }

    async fn subscribe_all(&mut self, filters: &[KeyFilter]) -> Result<()> {
        for key in KeyFilter::account_keys(filters) {
            let key = key.to_string();
            self.subscribe_key(&key, SubKind::Account).await?;
        }
        for key in KeyFilter::transaction_keys(filters) {
            let key = key.to_string();
            self.subscribe_key(&key, SubKind::Logs).await?;
        }
        Ok(())
    }

    fn desired_pairs(filters: &[KeyFilter]) -> Vec<(String, SubKind)> {
        let mut pairs = Vec::new();
        for key in KeyFilter::account_keys(filters) {
            pairs.push((key.to_string(), SubKind::Account));
        }
        for key in KeyFilter::transaction_keys(filters) {
            pairs.push((key.to_string(), SubKind::Logs));
        }
        pairs
    }

    /// Handle one parsed frame. Returns an update when the frame carries one.
    fn handle_frame(&mut self, value: Value) -> Option<RawUpdate> {
        // Subscription confirmations and unsubscribe acks carry an "id".
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(sub_id) = value.get("result").and_then(Value::as_u64) {
                if let Some((key, kind)) = self.pending.remove(&id) {
                    self.sub_ids.insert((key.clone(), kind), sub_id);
                    self.subs.insert(sub_id, (key, kind));
                }
            }
            return None;
        }

        let method = value.get("method").and_then(Value::as_str)?;
        let params = value.get("params")?;
        let sub_id = params.get("subscription").and_then(Value::as_u64)?;
        let (key, _) = self.subs.get(&sub_id)?.clone();
        let result = params.get("result")?;

        match method {
            "accountNotification" => parse_account_notification(&key, result)
                .map(RawUpdate::Account),
            "logsNotification" => parse_logs_notification(&key, result)
                .map(RawUpdate::Transaction),
            _ => {
                debug!("Ignoring pubsub method {}", method);
                None
            }
        }
    }
}

#[async_trait]
impl SourceConnection for PubsubConnection {
    async fn recv(&mut self) -> Result<Option<RawUpdate>> {
        loop {
            let message = match self.ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(anyhow!("websocket read failed: {}", e)),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    let value: Value = match serde_json::from_str(text.as_str()) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("Unparseable pubsub frame: {}", e);
                            continue;
                        }
                    };
                    if let Some(update) = self.handle_frame(value) {
                        return Ok(Some(update));
                    }
                }
                Message::Ping(payload) => {
                    self.ws
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| anyhow!("websocket pong failed: {}", e))?;
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    async fn resubscribe(&mut self, filters: &[KeyFilter]) -> Result<()> {
        let desired = Self::desired_pairs(filters);

        let current: Vec<(String, SubKind)> = self.sub_ids.keys().cloned().collect();
        for pair in &current {
            if !desired.contains(pair) {
                self.unsubscribe(&pair.0, pair.1).await?;
            }
        }

        for (key, kind) in desired {
            let active = self.sub_ids.contains_key(&(key.clone(), kind))
                || self.pending.values().any(|p| p.0 == key && p.1 == kind);
            if !active {
                self.subscribe_key(&key, kind).await?;
            }
        }

        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn parse_account_notification(key: &str, result: &Value) -> Option<AccountSnapshot> {
    let slot = result.pointer("/context/slot")?.as_u64()?;
    let account = result.get("value")?;

    // SPL token accounts expose the mint and amount through jsonParsed data;
    // everything else is a native SOL lamport balance.
    let parsed_info = account.pointer("/data/parsed/info");
    let (mint, balance) = match parsed_info.and_then(|info| {
        let mint = info.get("mint")?.as_str()?;
        let amount = info.pointer("/tokenAmount/amount")?.as_str()?;
        Some((mint.to_string(), Decimal::from_str(amount).ok()?))
    }) {
        Some(token) => token,
        None => {
            let lamports = account.get("lamports")?.as_u64()?;
            (NATIVE_SOL_MINT.to_string(), Decimal::from(lamports))
        }
    };

    Some(AccountSnapshot {
        public_key: key.to_string(),
        mint_address: mint,
        balance,
        slot,
        block_time: None,
        transaction_signature: None,
    })
}

fn parse_logs_notification(key: &str, result: &Value) -> Option<TransactionRecord> {
    let slot = result.pointer("/context/slot")?.as_u64()?;
    let value = result.get("value")?;
    let signature = value.get("signature")?.as_str()?.to_string();
    let err = value.get("err").cloned().unwrap_or(Value::Null);

    let logs: Vec<String> = value
        .get("logs")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(TransactionRecord {
        signature,
        slot,
        block_time: None,
        success: err.is_null(),
        error_message: (!err.is_null()).then(|| err.to_string()),
        program_ids: top_level_programs(&logs),
        log_messages: logs,
        account_keys: vec![key.to_string()],
    })
}

/// Extract top-level invoked program ids from log lines of the form
/// `Program <id> invoke [1]`, preserving order without duplicates.
fn top_level_programs(logs: &[String]) -> Vec<String> {
    let mut programs = Vec::new();
    for line in logs {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("Program") {
            continue;
        }
        let Some(id) = parts.next() else { continue };
        if parts.next() == Some("invoke") && parts.next() == Some("[1]") {
            let id = id.to_string();
            if !programs.contains(&id) {
                programs.push(id);
            }
        }
    }
    programs
}
