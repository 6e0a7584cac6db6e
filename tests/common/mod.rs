//! Shared utilities for integration testing.
//!
//! [`MockLedger`] is an in-process ledger node speaking the NUL-terminated
//! JSON protocol on a local TCP port. Blocks are built from real encoded
//! transactions so the gateway parses exactly what a node would send.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use ledger_gateway::config::{GatewayConfig, HealthCheckConfig, NodeConfig};
use ledger_gateway::ledger::rpc::{self, Incoming, Request, RpcError, WalletState};
use ledger_gateway::ledger::{BlockId, Digest, PublicKey, SignerKey, Token, WalletTag};
use ledger_gateway::sync::block::{encode_block, BlockHeader, SignedTx};

#[derive(Default)]
struct Chain {
    blocks: BTreeMap<BlockId, Vec<u8>>,
    wallets: HashMap<PublicKey, WalletState>,
    submitted: Vec<SignedTx>,
    rejections: VecDeque<i64>,
    auto_mine: bool,
    subscriptions: usize,
}

impl Chain {
    fn tip(&self) -> BlockId {
        self.blocks.keys().next_back().copied().unwrap_or(BlockId::ZERO)
    }

    fn append(&mut self, txs: &[SignedTx]) -> BlockId {
        let block_id = self.tip().next();
        let header = BlockHeader {
            version: 1,
            prev_digest: Digest::repeat_byte(0x11),
            merkle_root: Digest::repeat_byte(0x22),
            timestamp: 1_700_000_000,
            tx_count: txs.len() as u16,
            block_id,
            signers: Vec::new(),
        };
        self.blocks.insert(block_id, encode_block(&header, txs));
        block_id
    }
}

/// A scriptable ledger node.
#[derive(Clone)]
pub struct MockLedger {
    chain: Arc<Mutex<Chain>>,
    events: broadcast::Sender<BlockId>,
    addr: SocketAddr,
}

impl MockLedger {
    /// Start a node with `blocks` empty blocks already produced.
    pub async fn start(blocks: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(64);
        let ledger = Self {
            chain: Arc::new(Mutex::new(Chain::default())),
            events,
            addr,
        };
        for _ in 0..blocks {
            ledger.chain.lock().unwrap().append(&[]);
        }

        let node = ledger.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(node.clone().serve(socket));
            }
        });
        ledger
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn tip(&self) -> BlockId {
        self.chain.lock().unwrap().tip()
    }

    /// Include submitted transactions in a new block right away.
    pub fn set_auto_mine(&self, on: bool) {
        self.chain.lock().unwrap().auto_mine = on;
    }

    pub fn set_wallet(&self, wallet: PublicKey, state: WalletState) {
        self.chain.lock().unwrap().wallets.insert(wallet, state);
    }

    /// Reject the next submission with `code`.
    pub fn reject_next(&self, code: i64) {
        self.chain.lock().unwrap().rejections.push_back(code);
    }

    pub fn submitted(&self) -> Vec<SignedTx> {
        self.chain.lock().unwrap().submitted.clone()
    }

    /// How many `subscribe` calls the node has answered.
    pub fn subscriptions(&self) -> usize {
        self.chain.lock().unwrap().subscriptions
    }

    /// Produce a block without announcing it.
    pub fn produce_silently(&self, txs: &[SignedTx]) -> BlockId {
        self.chain.lock().unwrap().append(txs)
    }

    /// Produce a block and announce it to subscribers.
    pub fn produce(&self, txs: &[SignedTx]) -> BlockId {
        let block_id = self.chain.lock().unwrap().append(txs);
        let _ = self.events.send(block_id);
        block_id
    }

    async fn serve(self, mut socket: TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut subscription: Option<broadcast::Receiver<BlockId>> = None;

        loop {
            tokio::select! {
                read = socket.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = buf.iter().position(|b| *b == 0) {
                        let frame: Vec<u8> = buf.drain(..=pos).collect();
                        let Ok(request) = serde_json::from_slice::<Request>(&frame[..pos]) else {
                            return;
                        };
                        if request.method == rpc::METHOD_SUBSCRIBE {
                            subscription = Some(self.events.subscribe());
                            self.chain.lock().unwrap().subscriptions += 1;
                        }
                        let reply = self.handle(&request);
                        if write_frame(&mut socket, &reply).await.is_err() {
                            return;
                        }
                    }
                }
                Some(block_id) = next_event(&mut subscription) => {
                    let event = Incoming {
                        method: rpc::EVENT_BLOCKS_SYNCHRONIZED.to_string(),
                        id: None,
                        result: None,
                        error: None,
                        params: Some(json!({ "last_block_id": block_id })),
                    };
                    if write_frame(&mut socket, &event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn handle(&self, request: &Request) -> Incoming {
        let result = match request.method.as_str() {
            rpc::METHOD_CHAIN_STATE => Ok(json!({ "last_block_id": self.tip() })),
            rpc::METHOD_BLOCK_BY_ID => self.block(&request.params),
            rpc::METHOD_WALLET_STATE => self.wallet(&request.params),
            rpc::METHOD_ADD_TRANSACTION => self.add_transaction(&request.params),
            rpc::METHOD_SUBSCRIBE => Ok(json!({})),
            other => Err((-32601, format!("unknown method {}", other))),
        };
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err((code, message)) => (None, Some(RpcError { code, message })),
        };
        Incoming {
            method: request.method.clone(),
            id: Some(request.id),
            result,
            error,
            params: None,
        }
    }

    fn block(&self, params: &Value) -> Result<Value, (i64, String)> {
        let block_id: BlockId = serde_json::from_value(params["block_id"].clone()).map_err(|e| (400, e.to_string()))?;
        let chain = self.chain.lock().unwrap();
        let raw = chain.blocks.get(&block_id).ok_or((404, "unknown block".to_string()))?;
        Ok(json!({ "data": hex::encode(raw) }))
    }

    fn wallet(&self, params: &Value) -> Result<Value, (i64, String)> {
        let wallet: PublicKey = serde_json::from_value(params["wallet"].clone()).map_err(|e| (400, e.to_string()))?;
        let chain = self.chain.lock().unwrap();
        let state = chain.wallets.get(&wallet).cloned().unwrap_or_default();
        Ok(serde_json::to_value(state).unwrap())
    }

    fn add_transaction(&self, params: &Value) -> Result<Value, (i64, String)> {
        let raw = hex::decode(params["tx"].as_str().unwrap_or_default()).map_err(|e| (400, e.to_string()))?;
        let tx = SignedTx::decode(&raw).map_err(|e| (400, e.to_string()))?;

        let mut chain = self.chain.lock().unwrap();
        if let Some(code) = chain.rejections.pop_front() {
            return Err((code, "rejected by mock".to_string()));
        }
        chain.submitted.push(tx.clone());
        if chain.auto_mine {
            let block_id = chain.append(std::slice::from_ref(&tx));
            drop(chain);
            let _ = self.events.send(block_id);
        }
        Ok(json!({ "digest": tx.digest() }))
    }
}

async fn next_event(subscription: &mut Option<broadcast::Receiver<BlockId>>) -> Option<BlockId> {
    let Some(rx) = subscription else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(block_id) => return Some(block_id),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn write_frame(socket: &mut TcpStream, frame: &Incoming) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(frame).unwrap();
    bytes.push(0);
    socket.write_all(&bytes).await
}

/// Wallet state with the given balances (whole tokens) and tags.
pub fn wallet_state(coin: u64, stable: u64, tags: &[WalletTag], last_nonce: u64) -> WalletState {
    WalletState {
        balances: HashMap::from([
            (Token::Coin, ledger_gateway::ledger::Amount::whole(coin)),
            (Token::Stable, ledger_gateway::ledger::Amount::whole(stable)),
        ]),
        tags: tags.to_vec(),
        last_nonce,
    }
}

pub fn key(seed: u8) -> SignerKey {
    SignerKey::from_seed([seed; 32])
}

/// A config pointing at `ledger` with short timers suitable for tests.
pub fn test_config(ledger: &MockLedger) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.nodes = vec![NodeConfig {
        name: "mock".to_string(),
        address: ledger.endpoint(),
        max_connections: 8,
    }];
    config.pool.lease_timeout_secs = 5;
    config.pool.drain_timeout_secs = 2;
    config.health_check = HealthCheckConfig {
        enabled: false,
        ..HealthCheckConfig::default()
    };
    config.sync.block_retry_secs = 1;
    config.sync.reconnect_min_secs = 1;
    config.sync.reconnect_max_secs = 1;
    config.sync.batch_idle_ms = 10;
    config.sync.persist_retry_ms = 50;
    config.settlement.idle_min_secs = 1;
    config.settlement.idle_max_secs = 1;
    config.settlement.confirm_retry_ms = 50;
    config.notify.scan_interval_secs = 1;
    config
}

/// Poll `check` every 50 ms until it yields a value or `limit` passes.
pub async fn eventually<T, F, Fut>(limit: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
