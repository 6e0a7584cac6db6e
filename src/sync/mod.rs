//! Block synchronization.
//!
//! # Data Flow
//! ```text
//! block.rs    binary block layout, transaction kinds, normalization
//! parser.rs   fetch + decode one block, forward txs then progress
//! observer.rs live follow driven by blocks_synchronized events
//! ranger.rs   one-shot backfill of a historical range
//! filter.rs   region-of-interest routing by wallet set
//! pipeline.rs wiring of the above around a MatchSink
//! ```

pub mod block;
pub mod filter;
pub mod observer;
pub mod parser;
pub mod pipeline;
pub mod ranger;

pub use block::{Transaction, TxKind};
pub use filter::{Interest, Match, RoiHandle};
pub use parser::{Origin, Progress};
pub use pipeline::{MatchSink, Pipeline, PipelineSpec, StageTokens};
