//! Trait interfaces between the store and its collaborators.
//!
//! - [`ChainStore`]: the read/write contract a validator or sync engine uses
//!   (lode-node's `ChainDb` implements it)
//! - [`IndexQuery`]: lookups served by the optional secondary indexes
//!
//! All write methods are atomic: each call commits as one unit or not at all.

use crate::chain::{
    BlockStatus, ChainIndexEntry, ChainTip, ConnectBlockResult, DisconnectBlockResult,
    SpendJournal, TxLocation,
};
use crate::error::LodeError;
use crate::types::{Address, Block, BlockHeader, Hash256};

/// Persistent block chain storage.
///
/// Implementations are internally synchronized: writes are serialized and
/// readers observe only fully committed states.
pub trait ChainStore: Send + Sync {
    /// Store a block record and create its chain index entry with status
    /// [`BlockStatus::Unknown`]. Returns `false` if the block was already
    /// stored (idempotent no-op).
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::MissingParent`](crate::error::ChainStateError::MissingParent)
    ///   if the parent entry is not stored and the block is not a genesis block
    fn put_block(&self, block: &Block) -> Result<bool, LodeError>;

    /// Promote a stored block to the new chain tip, recording its spend journal.
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::ChainLinkage`](crate::error::ChainStateError::ChainLinkage)
    ///   if the block's parent is not the current tip
    /// - [`ChainStateError::BlockNotFound`](crate::error::ChainStateError::BlockNotFound)
    ///   if the block was never stored
    /// - [`ChainStateError::InvalidBlock`](crate::error::ChainStateError::InvalidBlock)
    ///   if the block is marked invalid
    fn connect_block(&self, hash: &Hash256, journal: SpendJournal) -> Result<ConnectBlockResult, LodeError>;

    /// Disconnect the tip, restoring its parent as the tip.
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::EmptyChain`](crate::error::ChainStateError::EmptyChain)
    ///   at genesis or on an empty chain
    fn disconnect_tip(&self) -> Result<DisconnectBlockResult, LodeError>;

    /// Record the validator's verdict on a stored block.
    fn set_block_status(&self, hash: &Hash256, status: BlockStatus) -> Result<(), LodeError>;

    /// Full block by id.
    fn fetch_block(&self, hash: &Hash256) -> Result<Block, LodeError>;

    /// Header by id.
    fn fetch_header(&self, hash: &Hash256) -> Result<BlockHeader, LodeError>;

    /// Chain index entry by id.
    fn chain_entry(&self, hash: &Hash256) -> Result<Option<ChainIndexEntry>, LodeError>;

    /// Current best tip, or `None` before genesis is connected.
    fn best_tip(&self) -> Result<Option<ChainTip>, LodeError>;

    /// Best-chain block id at `height`.
    fn block_hash_at(&self, height: u64) -> Result<Option<Hash256>, LodeError>;

    /// Whether a block record is stored.
    fn has_block(&self, hash: &Hash256) -> Result<bool, LodeError> {
        Ok(self.chain_entry(hash)?.is_some())
    }
}

/// Lookups served by the secondary indexes.
pub trait IndexQuery: Send + Sync {
    /// Location of a confirmed transaction.
    fn tx_location(&self, txid: &Hash256) -> Result<TxLocation, LodeError>;

    /// Transactions that paid to or spent from `address`, in chain order.
    fn txids_for_address(&self, address: &Address) -> Result<Vec<Hash256>, LodeError>;
}
