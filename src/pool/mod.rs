//! Ledger node connection pool.
//!
//! # Data Flow
//! ```text
//! caller
//!     → manager.rs (lease: balancer pick → slot permit → idle or new connection)
//!     → balancer.rs (least in_use + pending among probed nodes)
//!     → node.rs (per-node cap, health state, idle list)
//!
//! health.rs probes every node on a ticker and flips node availability
//! ```
//!
//! # Design Decisions
//! - Nodes are never removed, only marked unavailable
//! - Leases are RAII: dropping one returns its connection
//! - Connections are created lazily, up to the node cap

pub mod balancer;
pub mod health;
pub mod manager;
pub mod node;

pub use health::HealthMonitor;
pub use manager::{Lease, NodePool};
pub use node::{HealthState, Node};
