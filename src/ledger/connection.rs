//! A single persistent connection to a ledger node.
//!
//! # Responsibilities
//! - Send requests and match responses by `(method, id)`
//! - Buffer push events that arrive while waiting for a response
//! - Detect dead sockets so the pool can discard them
//!
//! # Design Decisions
//! - One borrower at a time; the pool hands connections out exclusively
//! - A timed-out request leaves the socket usable; the late answer is
//!   recognised by its id and dropped

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::ledger::codec::NulJsonCodec;
use crate::ledger::rpc::{self, ChainState, Event, Incoming, RawBlock, Request, Submitted, WalletState};
use crate::ledger::types::{BlockId, LedgerError, LedgerResult, PublicKey, Rejection};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Persistent RPC connection to one ledger node.
#[derive(Debug)]
pub struct LedgerConnection {
    id: ConnectionId,
    endpoint: String,
    framed: Framed<TcpStream, NulJsonCodec>,
    next_request_id: u64,
    events: VecDeque<Event>,
    request_timeout: Duration,
    closed: bool,
}

impl LedgerConnection {
    /// Open a TCP connection to `endpoint` (`host:port`).
    pub async fn connect(
        endpoint: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> LedgerResult<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(LedgerError::Transport(format!("connect {}: {}", endpoint, e)))
            }
            Err(_) => return Err(LedgerError::Timeout(connect_timeout.as_secs())),
        };
        stream.set_nodelay(true)?;

        let id = ConnectionId::new();
        tracing::debug!(connection_id = %id, endpoint = %endpoint, "Ledger connection opened");

        Ok(Self {
            id,
            endpoint: endpoint.to_string(),
            framed: Framed::new(stream, NulJsonCodec::default()),
            next_request_id: 1,
            events: VecDeque::new(),
            request_timeout,
            closed: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// True once the socket failed or the peer hung up.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the connection unusable so the pool discards it on release.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Issue a request and wait for its matching response.
    pub async fn call<T: DeserializeOwned>(&mut self, method: &str, params: Value) -> LedgerResult<T> {
        if self.closed {
            return Err(LedgerError::Transport(format!("{} is closed", self.id)));
        }

        let id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request {
            method: method.to_string(),
            id,
            params,
        };
        if let Err(e) = self.framed.send(request).await {
            self.closed = true;
            return Err(e);
        }

        let wait = self.request_timeout;
        let response = match timeout(wait, self.read_response(method, id)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(connection_id = %self.id, method = method, "RPC timeout");
                return Err(LedgerError::Timeout(wait.as_secs()));
            }
        };

        if let Some(err) = response.error {
            if method == rpc::METHOD_ADD_TRANSACTION {
                return Err(LedgerError::Rejected(Rejection::from_code(err.code, &err.message)));
            }
            return Err(LedgerError::Node {
                code: err.code,
                message: err.message,
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| LedgerError::Protocol(format!("bad {} result: {}", method, e)))
    }

    async fn read_response(&mut self, method: &str, id: u64) -> LedgerResult<Incoming> {
        loop {
            let frame = self.next_frame().await?;
            if frame.is_event() {
                self.buffer_event(frame);
                continue;
            }
            if frame.answers(method, id) {
                return Ok(frame);
            }
            tracing::debug!(
                connection_id = %self.id,
                method = %frame.method,
                id = ?frame.id,
                "Discarding stale response"
            );
        }
    }

    async fn next_frame(&mut self) -> LedgerResult<Incoming> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => {
                self.closed = true;
                Err(e)
            }
            None => {
                self.closed = true;
                Err(LedgerError::Transport(format!("{} closed by peer", self.endpoint)))
            }
        }
    }

    fn buffer_event(&mut self, frame: Incoming) {
        match Event::from_incoming(frame) {
            Ok(event) => self.events.push_back(event),
            Err(e) => tracing::warn!(connection_id = %self.id, error = %e, "Dropping malformed event"),
        }
    }

    /// Wait up to `wait` for the next push event.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub async fn next_event(&mut self, wait: Duration) -> LedgerResult<Option<Event>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if self.closed {
            return Err(LedgerError::Transport(format!("{} is closed", self.id)));
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.next_frame()).await {
                Ok(frame) => frame?,
                Err(_) => return Ok(None),
            };
            if frame.is_event() {
                self.buffer_event(frame);
                if let Some(event) = self.events.pop_front() {
                    return Ok(Some(event));
                }
            } else {
                tracing::debug!(connection_id = %self.id, method = %frame.method, "Discarding late response");
            }
        }
    }

    /// Query the node's chain tip.
    pub async fn chain_state(&mut self) -> LedgerResult<BlockId> {
        let state: ChainState = self.call(rpc::METHOD_CHAIN_STATE, json!({})).await?;
        Ok(state.last_block_id)
    }

    /// Fetch the raw bytes of one block.
    pub async fn block_by_id(&mut self, block_id: &BlockId) -> LedgerResult<Vec<u8>> {
        let raw: RawBlock = self
            .call(rpc::METHOD_BLOCK_BY_ID, json!({ "block_id": block_id }))
            .await?;
        hex::decode(raw.data.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Protocol(format!("block {} is not hex: {}", block_id, e)))
    }

    /// Query balances, tags and last nonce of a wallet.
    pub async fn wallet_state(&mut self, wallet: &PublicKey) -> LedgerResult<WalletState> {
        self.call(rpc::METHOD_WALLET_STATE, json!({ "wallet": wallet }))
            .await
    }

    /// Submit a signed transaction.
    pub async fn add_transaction(&mut self, tx: &[u8]) -> LedgerResult<Submitted> {
        self.call(rpc::METHOD_ADD_TRANSACTION, json!({ "tx": hex::encode(tx) }))
            .await
    }

    /// Ask the node to push `blocks_synchronized` events on this connection.
    pub async fn subscribe(&mut self) -> LedgerResult<()> {
        let _: Value = self
            .call(
                rpc::METHOD_SUBSCRIBE,
                json!({ "events": [rpc::EVENT_BLOCKS_SYNCHRONIZED] }),
            )
            .await?;
        Ok(())
    }

    /// Close the socket.
    pub async fn close(mut self) {
        self.closed = true;
        let _ = self.framed.close().await;
        tracing::debug!(connection_id = %self.id, "Ledger connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to obtain a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = LedgerConnection::connect(
            &addr.to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(LedgerError::Transport(_)) | Err(LedgerError::Timeout(_))));
    }
}
