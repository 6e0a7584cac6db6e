//! Incoming payments.
//!
//! # Data Flow
//! ```text
//! AddWallet / RemoveWallet
//!     → store (persisted subscription)
//!     → subscriptions.rs (wallet → services)
//!     → deposits filter (first subscriber adds, last removal drops)
//!
//! watcher-side sync pipeline
//!     → saver.rs (one deduplicated deposit row per subscribed service)
//! ```

pub mod saver;
pub mod subscriptions;

pub use saver::DepositSaver;
pub use subscriptions::Subscriptions;
