//! Outbound settlement.
//!
//! # Data Flow
//! ```text
//! store (Enqueued / stale Posted)
//!     → engine.rs (signer selection, fees, nonce, sign, broadcast)
//!     → ledger
//!
//! sender-side sync pipeline
//!     → confirmer.rs (Posted → Confirmed)
//! ```
//!
//! # Design Decisions
//! - The engine is the only writer of signer state
//! - Balance debits are optimistic and live in one function,
//!   [`signer::SignerTable::apply_optimistic_debit`]

pub mod confirmer;
pub mod engine;
pub mod fee;
pub mod signer;

pub use confirmer::Confirmer;
pub use engine::{EngineError, SettlementEngine, Step};
pub use fee::FeeSchedule;
