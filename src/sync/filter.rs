//! Region-of-interest filter.
//!
//! # Responsibilities
//! - Hold the set of watched wallets
//! - Route transactions touching a watched wallet downstream, in order
//! - Apply wallet additions/removals between batches
//!
//! # Data Flow
//! ```text
//! parser feed ──▶ batch (batch_size or idle timeout)
//!             ──▶ test each tx (sender ∈ set → outgoing, else recipient ∈ set → incoming)
//!             ──▶ flush matches and progress markers in order
//!             ──▶ apply pending add/remove ops (non-blocking drain)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ledger::PublicKey;
use crate::observability::metrics;
use crate::sync::block::{Transaction, TxKind};
use crate::sync::parser::{Feed, Progress};

/// Decides which matches a pipeline cares about.
pub trait Interest: Send + Sync {
    fn interested(&self, kind: TxKind, outgoing: bool) -> bool;
}

impl<F> Interest for F
where
    F: Fn(TxKind, bool) -> bool + Send + Sync,
{
    fn interested(&self, kind: TxKind, outgoing: bool) -> bool {
        self(kind, outgoing)
    }
}

/// A transaction touching a watched wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub tx: Transaction,
    /// The watched wallet that matched.
    pub wallet: PublicKey,
    /// True when the watched wallet is the sender.
    pub outgoing: bool,
}

/// Items the filter emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Match(Match),
    Progress(Progress),
}

#[derive(Debug)]
enum WalletOp {
    Add(Vec<PublicKey>),
    Remove(Vec<PublicKey>),
}

/// Cloneable handle for mutating a running filter's wallet set.
#[derive(Debug, Clone)]
pub struct RoiHandle {
    ops: mpsc::UnboundedSender<WalletOp>,
}

impl RoiHandle {
    /// Start watching `wallets`. Idempotent.
    pub fn add(&self, wallets: Vec<PublicKey>) {
        if !wallets.is_empty() && self.ops.send(WalletOp::Add(wallets)).is_err() {
            tracing::debug!("Filter stopped, wallet add dropped");
        }
    }

    /// Stop watching `wallets`. Idempotent.
    pub fn remove(&self, wallets: Vec<PublicKey>) {
        if !wallets.is_empty() && self.ops.send(WalletOp::Remove(wallets)).is_err() {
            tracing::debug!("Filter stopped, wallet remove dropped");
        }
    }
}

/// Batch sizing.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub size: usize,
    pub idle: Duration,
}

pub struct RoiFilter {
    name: &'static str,
    wallets: HashSet<PublicKey>,
    interest: Arc<dyn Interest>,
    ops: mpsc::UnboundedReceiver<WalletOp>,
    batch: BatchConfig,
}

impl RoiFilter {
    pub fn new(
        name: &'static str,
        initial: impl IntoIterator<Item = PublicKey>,
        interest: Arc<dyn Interest>,
        batch: BatchConfig,
    ) -> (Self, RoiHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = Self {
            name,
            wallets: initial.into_iter().collect(),
            interest,
            ops: rx,
            batch,
        };
        (filter, RoiHandle { ops: tx })
    }

    pub fn contains(&self, wallet: &PublicKey) -> bool {
        self.wallets.contains(wallet)
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// Run until the input closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Feed>,
        output: mpsc::Sender<Routed>,
        cancel: CancellationToken,
    ) {
        tracing::info!(pipeline = self.name, wallets = self.len(), "ROI filter starting");
        loop {
            let (batch, input_open) = tokio::select! {
                b = collect_batch(&mut input, self.batch) => b,
                _ = cancel.cancelled() => break,
            };
            if !self.cycle(batch, &output, &cancel).await {
                break;
            }
            if !input_open {
                tracing::info!(pipeline = self.name, "Filter input closed");
                break;
            }
        }
        tracing::info!(pipeline = self.name, "ROI filter stopped");
    }

    /// Test and flush one batch, then apply queued wallet ops. Returns false
    /// when downstream is gone or cancelled.
    async fn cycle(
        &mut self,
        batch: Vec<Feed>,
        output: &mpsc::Sender<Routed>,
        cancel: &CancellationToken,
    ) -> bool {
        // 1. Test
        let routed = route(&self.wallets, self.interest.as_ref(), batch);

        // 2. Flush in order
        for item in routed {
            if let Routed::Match(m) = &item {
                metrics::record_roi_match(self.name, m.outgoing);
            }
            tokio::select! {
                sent = output.send(item) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }

        // 3. Apply wallet ops without waiting
        while let Ok(op) = self.ops.try_recv() {
            match op {
                WalletOp::Add(keys) => {
                    let added = keys.into_iter().filter(|k| self.wallets.insert(*k)).count();
                    tracing::debug!(pipeline = self.name, added, total = self.wallets.len(), "Wallets added");
                }
                WalletOp::Remove(keys) => {
                    let removed = keys.iter().filter(|k| self.wallets.remove(*k)).count();
                    tracing::debug!(pipeline = self.name, removed, total = self.wallets.len(), "Wallets removed");
                }
            }
        }
        true
    }
}

/// Wait for the first item up to the idle timeout, then keep taking items
/// until the batch is full or input goes quiet. The flag is false once the
/// input channel is closed and empty.
async fn collect_batch(input: &mut mpsc::Receiver<Feed>, cfg: BatchConfig) -> (Vec<Feed>, bool) {
    let mut batch = Vec::with_capacity(cfg.size);
    while batch.len() < cfg.size {
        match tokio::time::timeout(cfg.idle, input.recv()).await {
            Ok(Some(item)) => batch.push(item),
            Ok(None) => return (batch, false),
            Err(_) => break,
        }
    }
    (batch, true)
}

/// At most one match per transaction. When both ends are watched and both
/// directions are wanted, the sender side wins.
fn route(wallets: &HashSet<PublicKey>, interest: &dyn Interest, batch: Vec<Feed>) -> Vec<Routed> {
    let mut out = Vec::new();
    for item in batch {
        match item {
            Feed::Progress(p) => out.push(Routed::Progress(p)),
            Feed::Tx(tx) => {
                if wallets.contains(&tx.sender) && interest.interested(tx.kind, true) {
                    out.push(Routed::Match(Match {
                        wallet: tx.sender,
                        tx,
                        outgoing: true,
                    }));
                } else if let Some(recipient) = tx
                    .recipient
                    .filter(|r| wallets.contains(r) && interest.interested(tx.kind, false))
                {
                    out.push(Routed::Match(Match {
                        tx,
                        wallet: recipient,
                        outgoing: false,
                    }));
                }
            }
        }
    }
    out
}
