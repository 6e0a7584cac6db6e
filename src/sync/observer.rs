//! Live chain follower.
//!
//! # Responsibilities
//! - Hold one subscribed connection and wait for `blocks_synchronized`
//! - Parse every new block strictly in order, starting at a given block
//! - Reconnect with randomized backoff when the session breaks
//!
//! # Design Decisions
//! - The subscribed connection is always discarded after a session; its
//!   socket carries a subscription no other borrower expects
//! - A silent node (no event within the idle watchdog) is treated as a
//!   broken session

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::ledger::rpc::Event;
use crate::ledger::{BlockId, LedgerError};
use crate::pool::{Lease, NodePool};
use crate::sync::parser::{drive_range, BlockParser, DriveOutcome};

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// No event within the idle watchdog.
    Idle,
    /// Cancelled or downstream closed.
    Stop,
}

pub struct BlockObserver {
    pool: Arc<NodePool>,
    parser: BlockParser,
    next: BlockId,
    config: SyncConfig,
}

impl BlockObserver {
    /// Follow the chain starting at `start`.
    pub fn new(pool: Arc<NodePool>, parser: BlockParser, start: BlockId, config: SyncConfig) -> Self {
        Self {
            pool,
            parser,
            next: start,
            config,
        }
    }

    /// First block not yet parsed.
    pub fn next_block(&self) -> BlockId {
        self.next
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(start = %self.next, "Block observer starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // 1. Lease a dedicated connection
            let lease_wait = self.pool.default_lease_timeout();
            let mut lease = tokio::select! {
                lease = self.pool.lease(lease_wait) => match lease {
                    Ok(lease) => lease,
                    Err(LedgerError::PoolClosed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Observer could not lease a connection");
                        if !self.backoff(&cancel).await {
                            break;
                        }
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            // 2. Subscribe, heartbeat, follow
            let outcome = self.session(&mut lease, &cancel).await;
            match outcome {
                Ok(SessionEnd::Stop) => {
                    lease.discard();
                    break;
                }
                Ok(SessionEnd::Idle) => {
                    tracing::warn!(
                        node = %lease.node().name,
                        idle_secs = self.config.idle_watchdog_secs,
                        "No events from node, reconnecting"
                    );
                    lease.discard();
                }
                Err(e) => {
                    tracing::warn!(node = %lease.node().name, error = %e, "Observer session failed");
                    if e.is_transport() || matches!(e, LedgerError::Protocol(_)) {
                        lease.fail(&e);
                    } else {
                        lease.discard();
                    }
                    if !self.backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(next = %self.next, "Block observer stopped");
    }

    async fn session(&mut self, lease: &mut Lease, cancel: &CancellationToken) -> Result<SessionEnd, LedgerError> {
        // Subscribe before reading the tip so no block falls between the two.
        lease.subscribe().await?;
        let tip = lease.chain_state().await?;
        tracing::info!(node = %lease.node().name, tip = %tip, next = %self.next, "Subscribed to block events");

        // Blocks produced while we were disconnected.
        if self.catch_up(tip, cancel).await != DriveOutcome::Completed {
            return Ok(SessionEnd::Stop);
        }

        let idle = Duration::from_secs(self.config.idle_watchdog_secs);
        loop {
            let event = tokio::select! {
                event = lease.next_event(idle) => event?,
                _ = cancel.cancelled() => return Ok(SessionEnd::Stop),
            };
            match event {
                None => return Ok(SessionEnd::Idle),
                Some(Event::BlocksSynchronized { last_block_id }) => {
                    tracing::debug!(reported = %last_block_id, next = %self.next, "Blocks synchronized");
                    match self.catch_up(last_block_id, cancel).await {
                        DriveOutcome::Completed => {}
                        DriveOutcome::Cancelled | DriveOutcome::Closed => return Ok(SessionEnd::Stop),
                    }
                }
                Some(Event::Other(method)) => {
                    tracing::debug!(method = %method, "Ignoring event");
                }
            }
        }
    }

    async fn catch_up(&mut self, to: BlockId, cancel: &CancellationToken) -> DriveOutcome {
        if to < self.next {
            return DriveOutcome::Completed;
        }
        let retry = Duration::from_secs(self.config.block_retry_secs);
        let outcome = drive_range(&self.parser, &mut self.next, to, retry, cancel).await;
        if outcome == DriveOutcome::Closed {
            tracing::info!("Observer feed closed");
        }
        outcome
    }

    /// Sleep a random 3–10 s (configurable). Returns false if cancelled.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        let secs = fastrand::u64(self.config.reconnect_min_secs..=self.config.reconnect_max_secs);
        tracing::debug!(delay_secs = secs, "Observer reconnect backoff");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
