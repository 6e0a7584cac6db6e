//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Open store → Pool + health → Chain tip → Pipelines → Engine → Notifier
//!
//! Shutdown (shutdown.rs):
//!     notifier → sinks → settlement → filters → producers → health → pool
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: store first, traffic-facing gateway last
//! - Ordered shutdown: consumers before producers
//! - Shutdown has a per-task deadline; stragglers are aborted

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownReport, Stage};
pub use startup::{start, App, StartOptions, StartupError};
