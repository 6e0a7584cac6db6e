//! Ledger node client.
//!
//! # Data Flow
//! ```text
//! caller
//!     → pool lease (exclusive LedgerConnection)
//!     → connection.rs (request id, response matching, event buffering)
//!     → codec.rs (JSON document + NUL terminator over TCP)
//!     → ledger node
//! ```
//!
//! # Design Decisions
//! - Rejections from `add_transaction` are classified into [`Rejection`]
//!   so the settlement engine can map them without string matching
//! - Signing keys come from the environment only (see [`keys`])

pub mod api;
pub mod codec;
pub mod connection;
pub mod keys;
pub mod rpc;
pub mod types;

pub use api::LedgerApi;
pub use connection::LedgerConnection;
pub use keys::SignerKey;
pub use types::{Amount, BlockId, Digest, LedgerError, LedgerResult, PublicKey, Rejection, Token, WalletTag};
