//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared by clone/Arc with all subsystems
//!
//! GATEWAY_SIGNER_KEYS (environment)
//!     → ledger::keys (never part of the file)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    FeeConfig, GatewayConfig, HealthCheckConfig, LogFormat, NodeConfig, NotifyConfig,
    ObservabilityConfig, PoolConfig, PublisherKind, SettlementConfig, StoreConfig, SyncConfig,
};
