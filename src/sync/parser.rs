//! Block fetching and decoding.
//!
//! # Responsibilities
//! - Fetch one block by id and decode it completely
//! - Forward the block's transactions in order, then its progress marker
//! - Drive a contiguous range of blocks, retrying a failing block forever
//!
//! # Design Decisions
//! - Decoding finishes before anything is forwarded, so a malformed block
//!   never produces a partial transaction stream
//! - Progress travels in-band behind the block's transactions so consumers
//!   observe it only after the transactions ahead of it

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ledger::{Amount, BlockId, LedgerApi, LedgerError, Token};
use crate::observability::metrics;
use crate::sync::block::{decode_block, BlockHeader, DecodeError, Transaction, TxKind};

/// Which producer parsed a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Live,
    Backfill,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Live => "live",
            Origin::Backfill => "backfill",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block whose transactions were all forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub origin: Origin,
    pub block_id: BlockId,
}

/// Items flowing from the parser to the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    Tx(Transaction),
    Progress(Progress),
}

/// Per-block aggregates. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub tx_count: usize,
    pub transferred_coin: Amount,
    pub transferred_stable: Amount,
    pub fees_coin: Amount,
    pub fees_stable: Amount,
    pub payload_bytes: usize,
}

impl BlockStats {
    fn add(&mut self, tx: &Transaction) {
        self.tx_count += 1;
        let (coin, stable) = (tx.amounts.get(Token::Coin), tx.amounts.get(Token::Stable));
        match tx.kind {
            TxKind::DistributionFee => {
                self.fees_coin = self.fees_coin.saturating_add(coin);
                self.fees_stable = self.fees_stable.saturating_add(stable);
            }
            _ => {
                self.transferred_coin = self.transferred_coin.saturating_add(coin);
                self.transferred_stable = self.transferred_stable.saturating_add(stable);
            }
        }
        self.payload_bytes += tx.payload.as_ref().map_or(0, Vec::len);
    }
}

/// Errors raised while synchronizing blocks.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("block {block_id} failed to decode: {source}")]
    Decode {
        block_id: BlockId,
        #[source]
        source: DecodeError,
    },

    #[error("requested block {expected}, node returned block {got}")]
    IdMismatch { expected: BlockId, got: BlockId },

    /// Downstream stopped consuming.
    #[error("downstream channel closed")]
    Closed,

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Errors after which retrying the block is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Closed | SyncError::Cancelled)
    }
}

/// Fetches, decodes and forwards blocks.
#[derive(Clone)]
pub struct BlockParser {
    ledger: Arc<dyn LedgerApi>,
    origin: Origin,
    feed: mpsc::Sender<Feed>,
}

impl BlockParser {
    pub fn new(ledger: Arc<dyn LedgerApi>, origin: Origin, feed: mpsc::Sender<Feed>) -> Self {
        Self {
            ledger,
            origin,
            feed,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Parse one block. `on_header` sees the header before any transaction
    /// is decoded.
    pub async fn parse<F>(
        &self,
        block_id: BlockId,
        on_header: F,
        cancel: &CancellationToken,
    ) -> Result<BlockStats, SyncError>
    where
        F: FnMut(&BlockHeader),
    {
        // 1. Fetch
        let raw = tokio::select! {
            raw = self.ledger.block_by_id(&block_id) => raw?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        // 2. Decode everything up front
        let (header, txs) =
            decode_block(&raw, on_header).map_err(|source| SyncError::Decode { block_id, source })?;
        if header.block_id != block_id {
            return Err(SyncError::IdMismatch {
                expected: block_id,
                got: header.block_id,
            });
        }

        // 3. Forward transactions in block order, then progress
        let mut stats = BlockStats::default();
        for tx in &txs {
            let normalized = Transaction::normalize(tx, block_id);
            stats.add(&normalized);
            self.send(Feed::Tx(normalized), cancel).await?;
        }
        self.send(
            Feed::Progress(Progress {
                origin: self.origin,
                block_id,
            }),
            cancel,
        )
        .await?;

        metrics::record_block_parsed(self.origin.as_str(), stats.tx_count);
        tracing::debug!(
            origin = %self.origin,
            block_id = %block_id,
            txs = stats.tx_count,
            coin = %stats.transferred_coin,
            stable = %stats.transferred_stable,
            payload_bytes = stats.payload_bytes,
            "Block parsed"
        );
        Ok(stats)
    }

    async fn send(&self, item: Feed, cancel: &CancellationToken) -> Result<(), SyncError> {
        tokio::select! {
            sent = self.feed.send(item) => sent.map_err(|_| SyncError::Closed),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

/// How a range drive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Every block up to and including the range end was parsed.
    Completed,
    Cancelled,
    /// The downstream feed is gone.
    Closed,
}

/// Parse `from..=to` strictly in order. A failing block is retried after
/// `retry_delay` until it succeeds; `next` always holds the first block not
/// yet parsed.
pub async fn drive_range(
    parser: &BlockParser,
    next: &mut BlockId,
    to: BlockId,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> DriveOutcome {
    while *next <= to {
        if cancel.is_cancelled() {
            return DriveOutcome::Cancelled;
        }

        let block_id = *next;
        match parser.parse(block_id, |_| {}, cancel).await {
            Ok(_) => {
                metrics::record_sync_height(parser.origin().as_str(), block_id.0.saturating_to::<u64>() as f64);
                *next = block_id.next();
            }
            Err(SyncError::Cancelled) => return DriveOutcome::Cancelled,
            Err(SyncError::Closed) => return DriveOutcome::Closed,
            Err(e) => {
                metrics::record_block_failure(parser.origin().as_str());
                tracing::warn!(
                    origin = %parser.origin(),
                    block_id = %block_id,
                    error = %e,
                    retry_in_secs = retry_delay.as_secs(),
                    "Block failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = cancel.cancelled() => return DriveOutcome::Cancelled,
                }
            }
        }
    }
    DriveOutcome::Completed
}
