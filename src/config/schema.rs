//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ledger::types::Amount;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Ledger node endpoints.
    pub nodes: Vec<NodeConfig>,

    /// Connection pool timeouts.
    pub pool: PoolConfig,

    /// Node health probing.
    pub health_check: HealthCheckConfig,

    /// Block observer, ranger and filter settings.
    pub sync: SyncConfig,

    /// Outbound settlement engine.
    pub settlement: SettlementConfig,

    /// Terminal-state notifications.
    pub notify: NotifyConfig,

    /// Persistence.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// One ledger node endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Identifier used in logs and metrics.
    pub name: String,

    /// Node address (e.g., "127.0.0.1:7100").
    pub address: String,

    /// Maximum concurrent connections to this node.
    #[serde(default = "default_max_node_conns")]
    pub max_connections: usize,
}

fn default_max_node_conns() -> usize {
    4
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Per-RPC response timeout in seconds.
    pub request_timeout_secs: u64,

    /// How long a caller waits for a free connection, in seconds.
    pub lease_timeout_secs: u64,

    /// Upper bound on waiting for outstanding leases at shutdown, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            lease_timeout_secs: 15,
            drain_timeout_secs: 10,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable periodic probes. When disabled every node is trusted as healthy.
    pub enabled: bool,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Probe timeout in seconds.
    pub timeout_secs: u64,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            unhealthy_threshold: 2,
            healthy_threshold: 1,
        }
    }
}

/// Block synchronization configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the historical backfill before following the chain.
    pub backfill_enabled: bool,

    /// Tear the subscription down after this many seconds without events.
    pub idle_watchdog_secs: u64,

    /// Delay before retrying a block that failed to parse or fetch.
    pub block_retry_secs: u64,

    /// Lower bound of the randomized reconnect backoff.
    pub reconnect_min_secs: u64,

    /// Upper bound of the randomized reconnect backoff.
    pub reconnect_max_secs: u64,

    /// Filter batch size.
    pub batch_size: usize,

    /// Flush a partial filter batch after this much input silence.
    pub batch_idle_ms: u64,

    /// Capacity of the bounded queues between pipeline stages.
    pub channel_capacity: usize,

    /// Delay between deposit persistence retries, in milliseconds.
    pub persist_retry_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backfill_enabled: true,
            idle_watchdog_secs: 300,
            block_retry_secs: 10,
            reconnect_min_secs: 3,
            reconnect_max_secs: 10,
            batch_size: 100,
            batch_idle_ms: 1000,
            channel_capacity: 1024,
            persist_retry_ms: 1000,
        }
    }
}

/// Settlement engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Run the settlement engine.
    pub enabled: bool,

    /// Blocks a Posted request may wait before it is re-broadcast.
    pub confirmation_lag_blocks: u64,

    /// Lower bound of the idle backoff between work cycles, in seconds.
    pub idle_min_secs: u64,

    /// Upper bound of the idle backoff between work cycles, in seconds.
    pub idle_max_secs: u64,

    /// Maximum requests loaded per work cycle and status.
    pub batch_limit: usize,

    /// Delay between persistence retries in the confirmer, in milliseconds.
    pub confirm_retry_ms: u64,

    /// Fee schedule.
    pub fees: FeeConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confirmation_lag_blocks: 20,
            idle_min_secs: 10,
            idle_max_secs: 30,
            batch_limit: 100,
            confirm_retry_ms: 1000,
            fees: FeeConfig::default(),
        }
    }
}

/// Transfer fee schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Flat fee charged on coin transfers.
    pub coin_flat: Amount,

    /// Floor of the stable transfer fee.
    pub stable_min: Amount,

    /// Cap applied in the top (lowest-rate) stable fee tier.
    pub stable_max: Amount,
}

impl Default for FeeConfig {
    fn default() -> Self {
        // 0.01 in base units.
        let cent = Amount::from_units(U256::from(10_000_000_000_000_000u64));
        Self {
            coin_flat: cent,
            stable_min: cent,
            stable_max: Amount::whole(100),
        }
    }
}

/// Publisher selection.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
    #[default]
    Log,
    Webhook,
}

/// Notification configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Run the notifier.
    pub enabled: bool,

    /// Where notifications go.
    pub publisher: PublisherKind,

    /// Target URL for the webhook publisher.
    pub webhook_url: Option<String>,

    /// Webhook request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Seconds between scans for un-notified requests.
    pub scan_interval_secs: u64,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Attempts after which a notification is abandoned.
    pub max_attempts: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publisher: PublisherKind::Log,
            webhook_url: None,
            request_timeout_secs: 10,
            scan_interval_secs: 5,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            max_attempts: 20,
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot file. In-memory only when unset.
    pub path: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
