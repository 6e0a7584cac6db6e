//! One sync pipeline, parameterized by interest and sink.
//!
//! # Data Flow
//! ```text
//! BlockRanger  (from..=tip)  ─┐
//!                             ├─▶ feed ──▶ RoiFilter ──▶ routed ──▶ sink task
//! BlockObserver (tip+1..)    ─┘                                   ├─ MatchSink::accept
//!                                                                 └─ CursorKeeper
//! ```
//!
//! # Design Decisions
//! - The watcher side (deposits) and sender side (confirmations) run the same
//!   pipeline; only the [`Interest`] and [`MatchSink`] differ
//! - The resume cursor only advances once every match ahead of a progress
//!   marker was accepted by the sink
//! - While a backfill is outstanding, live progress is held back so the
//!   cursor never jumps over unfinished history

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::ledger::{BlockId, LedgerApi, PublicKey};
use crate::pool::NodePool;
use crate::store::{Store, StoreError};
use crate::sync::filter::{BatchConfig, Interest, Match, RoiFilter, RoiHandle, Routed};
use crate::sync::observer::BlockObserver;
use crate::sync::parser::{BlockParser, Origin, Progress};
use crate::sync::ranger::{self, BlockRanger};

/// Downstream consumer of filtered matches.
#[async_trait]
pub trait MatchSink: Send + Sync {
    /// Handle one match. Implementations retry internally and return only
    /// once the match is handled or `cancel` fires.
    async fn accept(&self, m: Match, cancel: &CancellationToken);
}

/// Persists how far a pipeline has processed the chain.
pub struct CursorKeeper {
    name: String,
    store: Arc<dyn Store>,
    current: Option<BlockId>,
    backfill_to: Option<BlockId>,
    held_live: Option<BlockId>,
}

impl CursorKeeper {
    /// `backfill_to` is the end of an outstanding backfill, if one runs.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        current: Option<BlockId>,
        backfill_to: Option<BlockId>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            current,
            backfill_to,
            held_live: None,
        }
    }

    pub fn current(&self) -> Option<BlockId> {
        self.current
    }

    /// The block the cursor may move to after `progress`, if any.
    fn candidate(&mut self, progress: Progress) -> Option<BlockId> {
        match (progress.origin, self.backfill_to) {
            (Origin::Live, Some(_)) => {
                self.held_live = self.held_live.max(Some(progress.block_id));
                None
            }
            (Origin::Live, None) => Some(progress.block_id),
            (Origin::Backfill, Some(to)) if progress.block_id >= to => {
                self.backfill_to = None;
                self.held_live.take().max(Some(progress.block_id))
            }
            (Origin::Backfill, _) => Some(progress.block_id),
        }
    }

    /// Record a completed block. Never moves the cursor backwards.
    pub async fn observe(&mut self, progress: Progress) {
        let Some(candidate) = self.candidate(progress) else {
            return;
        };
        if self.current.is_some_and(|c| c >= candidate) {
            return;
        }
        match self.store.set_cursor(&self.name, candidate).await {
            Ok(()) => self.current = Some(candidate),
            // The next progress marker carries a later block; nothing is lost.
            Err(e) => tracing::warn!(cursor = %self.name, block_id = %candidate, error = %e, "Failed to persist cursor"),
        }
    }
}

/// What a pipeline consists of.
pub struct PipelineSpec {
    /// Also used as the cursor name.
    pub name: &'static str,
    pub interest: Arc<dyn Interest>,
    pub sink: Arc<dyn MatchSink>,
    pub wallets: Vec<PublicKey>,
}

/// Cancellation tokens for each stage, so a supervisor can stop them in order.
#[derive(Debug, Clone, Default)]
pub struct StageTokens {
    pub producers: CancellationToken,
    pub filter: CancellationToken,
    pub sink: CancellationToken,
}

/// Running pipeline tasks.
pub struct Pipeline {
    pub name: &'static str,
    pub roi: RoiHandle,
    pub producers: Vec<JoinHandle<()>>,
    pub filter: JoinHandle<()>,
    pub sink: JoinHandle<()>,
}

/// Start a pipeline. `tip` is the chain height seen at startup; the
/// observer begins at `tip + 1` and any backfill ends at `tip`.
pub async fn spawn(
    spec: PipelineSpec,
    pool: Arc<NodePool>,
    store: Arc<dyn Store>,
    config: &SyncConfig,
    tip: BlockId,
    backfill_from: Option<BlockId>,
    tokens: &StageTokens,
) -> Result<Pipeline, StoreError> {
    // 1. Work out the backfill range from the persisted cursor
    let cursor = store.cursor(spec.name).await?;
    let plan = if config.backfill_enabled {
        ranger::plan(cursor, backfill_from, tip)
    } else {
        None
    };
    tracing::info!(
        pipeline = spec.name,
        cursor = ?cursor.map(|c| c.to_string()),
        tip = %tip,
        backfill = ?plan.map(|p| format!("{}..={}", p.from, p.to)),
        wallets = spec.wallets.len(),
        "Starting sync pipeline"
    );

    // 2. Channels
    let (feed_tx, feed_rx) = mpsc::channel(config.channel_capacity);
    let (routed_tx, routed_rx) = mpsc::channel(config.channel_capacity);

    // 3. Sink
    let keeper = CursorKeeper::new(spec.name, store, cursor, plan.map(|p| p.to));
    let sink = tokio::spawn(run_sink(spec.name, routed_rx, spec.sink, keeper, tokens.sink.clone()));

    // 4. Filter
    let batch = BatchConfig {
        size: config.batch_size,
        idle: Duration::from_millis(config.batch_idle_ms),
    };
    let (filter, roi) = RoiFilter::new(spec.name, spec.wallets, spec.interest, batch);
    let filter = tokio::spawn(filter.run(feed_rx, routed_tx, tokens.filter.clone()));

    // 5. Producers
    let ledger: Arc<dyn LedgerApi> = pool.clone();
    let retry = Duration::from_secs(config.block_retry_secs);
    let mut producers = Vec::with_capacity(2);
    if let Some(plan) = plan {
        let parser = BlockParser::new(ledger.clone(), Origin::Backfill, feed_tx.clone());
        let ranger = BlockRanger::new(parser, plan, retry);
        let cancel = tokens.producers.clone();
        producers.push(tokio::spawn(async move {
            ranger.run(cancel).await;
        }));
    }
    let parser = BlockParser::new(ledger, Origin::Live, feed_tx);
    let observer = BlockObserver::new(pool, parser, tip.next(), config.clone());
    producers.push(tokio::spawn(observer.run(tokens.producers.clone())));

    Ok(Pipeline {
        name: spec.name,
        roi,
        producers,
        filter,
        sink,
    })
}

/// Feed matches to the sink and progress to the cursor keeper, in order.
pub async fn run_sink(
    name: &'static str,
    mut input: mpsc::Receiver<Routed>,
    sink: Arc<dyn MatchSink>,
    mut keeper: CursorKeeper,
    cancel: CancellationToken,
) {
    tracing::info!(pipeline = name, "Sink starting");
    loop {
        let item = tokio::select! {
            item = input.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        match item {
            Routed::Match(m) => {
                sink.accept(m, &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
            Routed::Progress(p) => keeper.observe(p).await,
        }
    }
    tracing::info!(
        pipeline = name,
        cursor = ?keeper.current().map(|c| c.to_string()),
        "Sink stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    fn b(n: u64) -> BlockId {
        BlockId::from_u64(n)
    }

    fn live(n: u64) -> Progress {
        Progress {
            origin: Origin::Live,
            block_id: b(n),
        }
    }

    fn backfill(n: u64) -> Progress {
        Progress {
            origin: Origin::Backfill,
            block_id: b(n),
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<u64>>);

    #[async_trait]
    impl MatchSink for Recording {
        async fn accept(&self, m: Match, _cancel: &CancellationToken) {
            self.0.lock().unwrap().push(m.tx.nonce);
        }
    }

    #[tokio::test]
    async fn test_cursor_without_backfill_follows_live() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = CursorKeeper::new("p", store.clone(), None, None);
        keeper.observe(live(5)).await;
        keeper.observe(live(6)).await;
        assert_eq!(store.cursor("p").await.unwrap(), Some(b(6)));
    }

    #[tokio::test]
    async fn test_cursor_holds_live_until_backfill_done() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = CursorKeeper::new("p", store.clone(), Some(b(2)), Some(b(10)));

        keeper.observe(live(11)).await;
        keeper.observe(live(12)).await;
        assert_eq!(store.cursor("p").await.unwrap(), None);

        keeper.observe(backfill(3)).await;
        assert_eq!(keeper.current(), Some(b(3)));

        keeper.observe(backfill(10)).await;
        assert_eq!(store.cursor("p").await.unwrap(), Some(b(12)));

        keeper.observe(live(13)).await;
        assert_eq!(keeper.current(), Some(b(13)));
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = CursorKeeper::new("p", store.clone(), Some(b(20)), Some(b(25)));
        // An override re-covers blocks the cursor already passed.
        keeper.observe(backfill(5)).await;
        assert_eq!(keeper.current(), Some(b(20)));
        assert_eq!(store.cursor("p").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sink_processes_in_order() {
        use crate::sync::block::Transaction;
        use crate::sync::parser::tests::transfer;

        let store = Arc::new(MemoryStore::new());
        let keeper = CursorKeeper::new("p", store.clone(), None, None);
        let sink = Arc::new(Recording::default());
        let (tx, rx) = mpsc::channel(8);

        let m = |nonce| {
            let tx = Transaction::normalize(&transfer(1, nonce, PublicKey([2; 32])), b(1));
            Routed::Match(Match {
                wallet: PublicKey([2; 32]),
                outgoing: false,
                tx,
            })
        };
        tx.send(m(1)).await.unwrap();
        tx.send(m(2)).await.unwrap();
        tx.send(Routed::Progress(live(1))).await.unwrap();
        drop(tx);

        run_sink("p", rx, sink.clone(), keeper, CancellationToken::new()).await;
        assert_eq!(*sink.0.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.cursor("p").await.unwrap(), Some(b(1)));
    }
}
