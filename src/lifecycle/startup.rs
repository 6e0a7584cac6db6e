//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every subsystem from a validated [`GatewayConfig`]
//! - Start background tasks and register them for staged shutdown
//! - Hand back an [`App`] exposing the [`Gateway`] to transport adapters
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal, and tasks already started are
//!   stopped before the error is returned
//! - Subsystems initialize in dependency order, not concurrently
//! - Both pipelines start from the same chain tip

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{GatewayConfig, PublisherKind};
use crate::gateway::Gateway;
use crate::ledger::{BlockId, LedgerApi, SignerKey};
use crate::lifecycle::shutdown::{Shutdown, ShutdownReport, Stage};
use crate::notify::{LogPublisher, Notifier, NotifyError, Publisher, WebhookPublisher};
use crate::payments::{saver, DepositSaver, Subscriptions};
use crate::pool::{HealthMonitor, NodePool};
use crate::settlement::{confirmer, Confirmer, EngineError, SettlementEngine};
use crate::store::{MemoryStore, Store, StoreError};
use crate::sync::pipeline::{self, Pipeline, PipelineSpec, StageTokens};

/// Cursor name of the watcher-side pipeline.
pub const DEPOSITS_PIPELINE: &str = "deposits";
/// Cursor name of the sender-side pipeline.
pub const SETTLEMENT_PIPELINE: &str = "settlement";

/// Time each task gets to exit once its stage is cancelled.
const TASK_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("settlement engine: {0}")]
    Engine(#[from] EngineError),

    #[error("notifier: {0}")]
    Notify(#[from] NotifyError),

    #[error("startup cancelled")]
    Cancelled,
}

/// Inputs that do not come from the config file.
#[derive(Default)]
pub struct StartOptions {
    /// Backfill from this block even when a cursor exists.
    pub backfill_from: Option<BlockId>,

    /// Keys the settlement engine signs with.
    pub signer_keys: Vec<SignerKey>,
}

/// A running gateway.
pub struct App {
    gateway: Gateway,
    pool: Arc<NodePool>,
    engine: Option<Arc<SettlementEngine>>,
    shutdown: Shutdown,
    drain: Duration,
}

impl App {
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn engine(&self) -> Option<&Arc<SettlementEngine>> {
        self.engine.as_ref()
    }

    /// Stop every task stage by stage, then close the pool.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!(tasks = self.shutdown.task_count(), "Shutting down");
        let report = self.shutdown.run(TASK_GRACE).await;
        self.pool.close(self.drain).await;
        tracing::info!(stopped = report.stopped, aborted = report.aborted, "Shutdown complete");
        report
    }
}

/// Open the store the config asks for.
pub fn open_store(config: &GatewayConfig) -> Result<Arc<dyn Store>, StoreError> {
    Ok(match &config.store.path {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => {
            tracing::warn!("No store path configured, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    })
}

/// Build and start the gateway. `cancel` aborts startup while it waits on
/// the ledger.
pub async fn start(
    config: GatewayConfig,
    options: StartOptions,
    cancel: &CancellationToken,
) -> Result<App, StartupError> {
    let store = open_store(&config)?;
    let pool = Arc::new(NodePool::new(&config.nodes, config.pool.clone()));
    let mut shutdown = Shutdown::new();

    match launch(&config, options, store, &pool, &mut shutdown, cancel).await {
        Ok((gateway, engine)) => Ok(App {
            gateway,
            pool,
            engine,
            shutdown,
            drain: Duration::from_secs(config.pool.drain_timeout_secs),
        }),
        Err(e) => {
            tracing::error!(error = %e, "Startup failed, stopping started tasks");
            shutdown.run(TASK_GRACE).await;
            pool.close(Duration::from_secs(config.pool.drain_timeout_secs)).await;
            Err(e)
        }
    }
}

async fn launch(
    config: &GatewayConfig,
    options: StartOptions,
    store: Arc<dyn Store>,
    pool: &Arc<NodePool>,
    shutdown: &mut Shutdown,
    cancel: &CancellationToken,
) -> Result<(Gateway, Option<Arc<SettlementEngine>>), StartupError> {
    // 1. Health monitor, so nodes become leasable
    let monitor = HealthMonitor::new(pool.clone(), config.health_check.clone());
    let handle = tokio::spawn(monitor.run(shutdown.token(Stage::Health)));
    shutdown.track(Stage::Health, "health-monitor", handle);

    // 2. Chain tip both pipelines start from
    let tip = chain_tip(pool, Duration::from_secs(config.sync.block_retry_secs), cancel).await?;
    tracing::info!(tip = %tip, "Chain tip fetched");

    let tokens = StageTokens {
        producers: shutdown.token(Stage::Producers),
        filter: shutdown.token(Stage::Filters),
        sink: shutdown.token(Stage::Sinks),
    };

    // 3. Watcher side
    let subscriptions = Subscriptions::from_pairs(store.list_subscriptions().await?);
    let retry = Duration::from_millis(config.sync.persist_retry_ms);
    let deposits = pipeline::spawn(
        PipelineSpec {
            name: DEPOSITS_PIPELINE,
            interest: Arc::new(saver::interest),
            sink: Arc::new(DepositSaver::new(store.clone(), subscriptions.clone(), retry)),
            wallets: subscriptions.wallets(),
        },
        pool.clone(),
        store.clone(),
        &config.sync,
        tip,
        options.backfill_from,
        &tokens,
    )
    .await?;
    let deposits_roi = deposits.roi.clone();
    track_pipeline(shutdown, deposits);

    // 4. Sender side
    let engine = if config.settlement.enabled {
        let engine = Arc::new(SettlementEngine::new(
            options.signer_keys,
            pool.clone() as Arc<dyn LedgerApi>,
            store.clone(),
            config.settlement.clone(),
        )?);

        let confirm_retry = Duration::from_millis(config.settlement.confirm_retry_ms);
        let settlement = pipeline::spawn(
            PipelineSpec {
                name: SETTLEMENT_PIPELINE,
                interest: Arc::new(confirmer::interest),
                sink: Arc::new(Confirmer::new(store.clone(), confirm_retry)),
                wallets: engine.signer_keys(),
            },
            pool.clone(),
            store.clone(),
            &config.sync,
            tip,
            options.backfill_from,
            &tokens,
        )
        .await?;
        track_pipeline(shutdown, settlement);

        let handle = tokio::spawn(engine.clone().run(shutdown.token(Stage::Settlement)));
        shutdown.track(Stage::Settlement, "settlement-engine", handle);
        Some(engine)
    } else {
        tracing::info!("Settlement disabled");
        None
    };

    // 5. Notifier
    if config.notify.enabled {
        let publisher: Arc<dyn Publisher> = match config.notify.publisher {
            PublisherKind::Log => Arc::new(LogPublisher),
            PublisherKind::Webhook => {
                let url = config.notify.webhook_url.as_deref().unwrap_or_default();
                Arc::new(WebhookPublisher::new(
                    url,
                    Duration::from_secs(config.notify.request_timeout_secs),
                )?)
            }
        };
        let notifier = Notifier::new(store.clone(), publisher, config.notify.clone());
        let handle = tokio::spawn(notifier.run(shutdown.token(Stage::Notifier)));
        shutdown.track(Stage::Notifier, "notifier", handle);
    }

    tracing::info!(
        nodes = pool.nodes().len(),
        watched_wallets = subscriptions.count(),
        settlement = engine.is_some(),
        tasks = shutdown.task_count(),
        "Gateway started"
    );
    Ok((Gateway::new(store, subscriptions, deposits_roi), engine))
}

fn track_pipeline(shutdown: &mut Shutdown, pipeline: Pipeline) {
    for handle in pipeline.producers {
        shutdown.track(Stage::Producers, "block-producer", handle);
    }
    shutdown.track(Stage::Filters, "roi-filter", pipeline.filter);
    shutdown.track(Stage::Sinks, "match-sink", pipeline.sink);
}

/// Current chain height, retried until a node answers.
async fn chain_tip(
    ledger: &Arc<NodePool>,
    retry: Duration,
    cancel: &CancellationToken,
) -> Result<BlockId, StartupError> {
    loop {
        match ledger.chain_height().await {
            Ok(tip) => return Ok(tip),
            Err(e) => {
                tracing::warn!(error = %e, retry_secs = retry.as_secs(), "Failed to fetch chain tip, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = cancel.cancelled() => return Err(StartupError::Cancelled),
                }
            }
        }
    }
}
