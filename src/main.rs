//! Ledger payment gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!   ledger nodes ◀──── pool (leases, health) ◀────┬──────────────────────┐
//!                                                 │                      │
//!         ┌──────── deposits pipeline ────────────┤                      │
//!         │  observer/ranger → parser → filter → saver → store           │
//!         │                                                              │
//!         ├──────── settlement pipeline ──────────┤                      │
//!         │  observer/ranger → parser → filter → confirmer → store       │
//!         │                                                              │
//!         └──────── settlement engine ── store (Enqueued) → sign → broadcast
//!
//!   gateway (enqueue, subscriptions) → store → notifier → publisher
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use ledger_gateway::config::{load_config, LogFormat};
use ledger_gateway::ledger::{BlockId, SignerKey};
use ledger_gateway::lifecycle::{self, signals, StartOptions, StartupError};
use ledger_gateway::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "ledger-gateway", version, about = "Payment gateway for a ledger network")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Backfill both pipelines from this block, ignoring stored cursors.
    #[arg(long)]
    backfill_from: Option<BlockId>,

    /// Override the configured log format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let format = args.log_format.unwrap_or(config.observability.log_format);
    logging::init(&config.observability.log_level, format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        nodes = config.nodes.len(),
        "ledger-gateway starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let signer_keys = if config.settlement.enabled {
        SignerKey::load_all_from_env()?
    } else {
        Vec::new()
    };

    // A signal during startup aborts it.
    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        let name = signals::wait_for_signal().await;
        tracing::info!(signal = name, "Received shutdown signal");
        signal_stop.cancel();
    });

    let options = StartOptions {
        backfill_from: args.backfill_from,
        signer_keys,
    };
    let app = match lifecycle::start(config, options, &stop).await {
        Ok(app) => app,
        Err(StartupError::Cancelled) => {
            tracing::info!("Startup cancelled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    stop.cancelled().await;
    app.shutdown().await;
    Ok(())
}
