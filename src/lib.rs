//! Ledger payment gateway library.

pub mod config;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod notify;
pub mod observability;
pub mod payments;
pub mod pool;
pub mod resilience;
pub mod settlement;
pub mod store;
pub mod sync;

pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use lifecycle::{App, Shutdown};
