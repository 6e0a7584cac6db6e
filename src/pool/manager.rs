//! Node pool management.
//!
//! # Responsibilities
//! - Hand out exclusive connections (leases) balanced across nodes
//! - Create connections lazily up to each node's cap, reuse idle ones
//! - Mark nodes unavailable when a live call fails at the transport level
//! - Drain outstanding leases and close idle connections on shutdown
//!
//! # Design Decisions
//! - A lease owns a semaphore permit; the permit is the connection slot
//! - Closed connections are discarded on release, never reused
//! - A node that fails to connect is skipped until the health monitor
//!   sees it answer again

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, PoolConfig};
use crate::ledger::rpc::{Event, Submitted, WalletState};
use crate::ledger::{BlockId, LedgerApi, LedgerConnection, LedgerError, LedgerResult, PublicKey};
use crate::observability::metrics;
use crate::pool::balancer::{Balancer, LeastLoad};
use crate::pool::node::Node;

/// How often a lease waiting for any available node re-checks.
const NO_NODE_POLL: Duration = Duration::from_millis(100);

/// Outstanding lease bookkeeping for the shutdown drain.
#[derive(Debug, Default)]
struct LeaseTracker {
    outstanding: AtomicUsize,
    released: Notify,
}

/// Load-balanced pool of ledger node connections.
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    balancer: Box<dyn Balancer>,
    config: PoolConfig,
    closed: AtomicBool,
    closing: CancellationToken,
    tracker: Arc<LeaseTracker>,
}

impl NodePool {
    /// Create a pool from configuration.
    pub fn new(nodes: &[NodeConfig], config: PoolConfig) -> Self {
        Self::with_balancer(nodes, config, Box::new(LeastLoad::new()))
    }

    pub fn with_balancer(nodes: &[NodeConfig], config: PoolConfig, balancer: Box<dyn Balancer>) -> Self {
        let nodes = nodes.iter().map(|n| Arc::new(Node::new(n))).collect();
        Self {
            nodes,
            balancer,
            config,
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
            tracker: Arc::new(LeaseTracker::default()),
        }
    }

    /// All nodes (for health checking).
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Leases handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding.load(Ordering::Acquire)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    pub fn default_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.config.lease_timeout_secs)
    }

    /// Borrow a connection, waiting up to `wait` for a free slot.
    pub async fn lease(&self, wait: Duration) -> LedgerResult<Lease> {
        let deadline = Instant::now() + wait;

        loop {
            if self.is_closed() {
                return Err(LedgerError::PoolClosed);
            }

            // 1. Pick the least loaded node that passed a probe
            let node = match self.balancer.pick(&self.nodes) {
                Some(node) => node,
                None => {
                    if Instant::now() >= deadline {
                        metrics::record_lease_failure("no_available_node");
                        return Err(LedgerError::PoolExhausted(wait));
                    }
                    let nap = (Instant::now() + NO_NODE_POLL).min(deadline);
                    tokio::select! {
                        _ = tokio::time::sleep_until(nap) => continue,
                        _ = self.closing.cancelled() => return Err(LedgerError::PoolClosed),
                    }
                }
            };

            // 2. Wait for a connection slot on that node
            let permit = {
                let _pending = node.pending_guard();
                tokio::select! {
                    acquired = tokio::time::timeout_at(deadline, node.permits.clone().acquire_owned()) => {
                        match acquired {
                            Ok(Ok(permit)) => permit,
                            Ok(Err(_)) => return Err(LedgerError::PoolClosed),
                            Err(_) => {
                                metrics::record_lease_failure("timeout");
                                return Err(LedgerError::PoolExhausted(wait));
                            }
                        }
                    }
                    _ = self.closing.cancelled() => return Err(LedgerError::PoolClosed),
                }
            };

            // 3. Reuse an idle connection or open a new one
            let conn = match node.take_idle() {
                Some(conn) => conn,
                None => match LedgerConnection::connect(
                    &node.endpoint,
                    self.connect_timeout(),
                    self.request_timeout(),
                )
                .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        if node.mark_unavailable() {
                            tracing::warn!(node = %node.name, error = %e, "Node unavailable, connect failed");
                            metrics::record_node_health(&node.name, false);
                        }
                        drop(permit);
                        continue;
                    }
                },
            };

            self.tracker.outstanding.fetch_add(1, Ordering::AcqRel);
            metrics::record_lease(&node.name);
            tracing::trace!(node = %node.name, connection_id = %conn.id(), "Lease granted");

            return Ok(Lease {
                conn: Some(conn),
                node,
                permit: Some(permit),
                tracker: self.tracker.clone(),
            });
        }
    }

    /// Shut down: refuse new leases, wait up to `drain` for outstanding
    /// leases, then close every idle connection.
    pub async fn close(&self, drain: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closing.cancel();
        tracing::info!(outstanding = self.outstanding(), "Closing node pool");

        let drained = tokio::time::timeout(drain, async {
            loop {
                let released = self.tracker.released.notified();
                if self.tracker.outstanding.load(Ordering::Acquire) == 0 {
                    break;
                }
                released.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                outstanding = self.outstanding(),
                "Pool drain timed out, closing with leases outstanding"
            );
        }

        for node in &self.nodes {
            node.permits.close();
            for conn in node.drain_idle() {
                conn.close().await;
            }
        }
        tracing::info!("Node pool closed");
    }
}

#[async_trait]
impl LedgerApi for NodePool {
    async fn chain_height(&self) -> LedgerResult<BlockId> {
        let mut lease = self.lease(self.default_lease_timeout()).await?;
        let result = lease.chain_state().await;
        lease.settle(&result);
        result
    }

    async fn block_by_id(&self, block_id: &BlockId) -> LedgerResult<Vec<u8>> {
        let mut lease = self.lease(self.default_lease_timeout()).await?;
        let result = lease.block_by_id(block_id).await;
        lease.settle(&result);
        result
    }

    async fn wallet_state(&self, wallet: &PublicKey) -> LedgerResult<WalletState> {
        let mut lease = self.lease(self.default_lease_timeout()).await?;
        let result = lease.wallet_state(wallet).await;
        lease.settle(&result);
        result
    }

    async fn add_transaction(&self, tx: &[u8]) -> LedgerResult<Submitted> {
        let mut lease = self.lease(self.default_lease_timeout()).await?;
        let result = lease.add_transaction(tx).await;
        lease.settle(&result);
        result
    }
}

/// Exclusive use of one connection. Returned to the pool on drop.
#[derive(Debug)]
pub struct Lease {
    conn: Option<LedgerConnection>,
    node: Arc<Node>,
    permit: Option<OwnedSemaphorePermit>,
    tracker: Arc<LeaseTracker>,
}

impl Lease {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The leased connection. `None` only after the lease was settled.
    pub fn connection(&mut self) -> Option<&mut LedgerConnection> {
        self.conn.as_mut()
    }

    fn conn_mut(&mut self) -> LedgerResult<&mut LedgerConnection> {
        self.conn.as_mut().ok_or(LedgerError::PoolClosed)
    }

    pub async fn chain_state(&mut self) -> LedgerResult<BlockId> {
        self.conn_mut()?.chain_state().await
    }

    pub async fn block_by_id(&mut self, block_id: &BlockId) -> LedgerResult<Vec<u8>> {
        self.conn_mut()?.block_by_id(block_id).await
    }

    pub async fn wallet_state(&mut self, wallet: &PublicKey) -> LedgerResult<WalletState> {
        self.conn_mut()?.wallet_state(wallet).await
    }

    pub async fn add_transaction(&mut self, tx: &[u8]) -> LedgerResult<Submitted> {
        self.conn_mut()?.add_transaction(tx).await
    }

    pub async fn subscribe(&mut self) -> LedgerResult<()> {
        self.conn_mut()?.subscribe().await
    }

    pub async fn next_event(&mut self, wait: Duration) -> LedgerResult<Option<Event>> {
        self.conn_mut()?.next_event(wait).await
    }

    /// Return the connection to the idle list.
    pub fn release(self) {}

    /// Close the connection instead of returning it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_closed();
        }
    }

    /// Discard the connection and stop leasing from its node.
    pub fn fail(self, error: &LedgerError) {
        if self.node.mark_unavailable() {
            tracing::warn!(node = %self.node.name, error = %error, "Node unavailable after failed call");
            metrics::record_node_health(&self.node.name, false);
        }
        self.discard();
    }

    /// Release or fail depending on how the call went.
    pub fn settle<T>(self, result: &LedgerResult<T>) {
        match result {
            Err(e @ (LedgerError::Transport(_) | LedgerError::Protocol(_))) => self.fail(e),
            Err(LedgerError::Timeout(_)) => self.discard(),
            _ => self.release(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_closed() || self.node.permits.is_closed() {
                tracing::trace!(node = %self.node.name, connection_id = %conn.id(), "Dropping connection");
            } else {
                self.node.put_idle(conn);
            }
        }
        // Free the slot only after the connection is back in the idle list.
        drop(self.permit.take());
        self.tracker.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.tracker.released.notify_waiters();
    }
}
