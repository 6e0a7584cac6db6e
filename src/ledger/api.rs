//! The ledger operations the rest of the gateway depends on.
//!
//! Components take an `Arc<dyn LedgerApi>` so tests can substitute an
//! in-memory chain for the node pool.

use async_trait::async_trait;

use crate::ledger::rpc::{Submitted, WalletState};
use crate::ledger::types::{BlockId, LedgerResult, PublicKey};

#[async_trait]
pub trait LedgerApi: Send + Sync {
    /// Id of the newest block the node has imported.
    async fn chain_height(&self) -> LedgerResult<BlockId>;

    /// Raw encoded block.
    async fn block_by_id(&self, block_id: &BlockId) -> LedgerResult<Vec<u8>>;

    async fn wallet_state(&self, wallet: &PublicKey) -> LedgerResult<WalletState>;

    /// Broadcast an encoded, signed transaction.
    async fn add_transaction(&self, tx: &[u8]) -> LedgerResult<Submitted>;
}
