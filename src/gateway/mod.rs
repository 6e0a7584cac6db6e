//! Enqueue and wallet-subscription surface.
//!
//! Transport adapters (message bus, HTTP) call only into [`Gateway`]:
//! `enqueue` answers synchronously with success, duplicate or a validation
//! error. Terminal outcomes arrive later through the notifier.

pub mod service;
pub mod types;

pub use service::Gateway;
pub use types::{EnqueueOutcome, EnqueueRequest, GatewayError};
