//! The open store: engine, block store and index manager behind one handle.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use lode_core::chain::{
    BlockStatus, ChainIndexEntry, ChainTip, ConnectBlockResult, DisconnectBlockResult,
    SpendJournal, TxLocation,
};
use lode_core::error::LodeError;
use lode_core::traits::{ChainStore, IndexQuery};
use lode_core::types::{Address, Block, BlockHeader, Hash256};

use crate::engine::{Engine, EngineConfig};
use crate::indexers::IndexManager;
use crate::interrupt::Interrupt;
use crate::storage::BlockStore;
use crate::upgrade;

/// Shared handle to an open, upgraded store.
pub struct ChainDb {
    engine: Arc<Engine>,
    blocks: BlockStore,
    indexes: Arc<IndexManager>,
}

impl ChainDb {
    /// Open the engine at `path` and bring its schema up to date. The
    /// engine is closed again if the upgrade fails.
    pub fn open(path: impl AsRef<Path>, config: &EngineConfig, interrupt: &Interrupt) -> Result<Self, LodeError> {
        let engine = Arc::new(Engine::open(path, config)?);
        if let Err(e) = upgrade::upgrade(&engine, interrupt) {
            if let Err(close_err) = engine.close() {
                warn!("closing after failed upgrade: {close_err}");
            }
            return Err(e);
        }
        Ok(Self::from_engine(engine))
    }

    /// Wrap an engine whose schema is already current.
    pub fn from_engine(engine: Arc<Engine>) -> Self {
        let chain_lock = Arc::new(Mutex::new(()));
        let indexes = Arc::new(IndexManager::new(Arc::clone(&engine), Arc::clone(&chain_lock)));
        let blocks = BlockStore::new(Arc::clone(&engine), Arc::clone(&indexes), chain_lock);
        Self {
            engine,
            blocks,
            indexes,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Flush and release the engine. Later calls on any handle fail with
    /// `StorageError::Closed`. Outside this crate only the coordinator's
    /// [`StoreGuard`](crate::lifecycle::StoreGuard) closes a running store.
    pub(crate) fn close(&self) -> Result<(), LodeError> {
        self.engine.close()
    }
}

impl ChainStore for ChainDb {
    fn put_block(&self, block: &Block) -> Result<bool, LodeError> {
        self.blocks.put_block(block)
    }

    fn connect_block(&self, hash: &Hash256, journal: SpendJournal) -> Result<ConnectBlockResult, LodeError> {
        self.blocks.connect_block(hash, journal)
    }

    fn disconnect_tip(&self) -> Result<DisconnectBlockResult, LodeError> {
        self.blocks.disconnect_tip()
    }

    fn set_block_status(&self, hash: &Hash256, status: BlockStatus) -> Result<(), LodeError> {
        self.blocks.set_block_status(hash, status)
    }

    fn fetch_block(&self, hash: &Hash256) -> Result<Block, LodeError> {
        self.blocks.fetch_block(hash)
    }

    fn fetch_header(&self, hash: &Hash256) -> Result<BlockHeader, LodeError> {
        self.blocks.fetch_header(hash)
    }

    fn chain_entry(&self, hash: &Hash256) -> Result<Option<ChainIndexEntry>, LodeError> {
        self.blocks.chain_entry(hash)
    }

    fn best_tip(&self) -> Result<Option<ChainTip>, LodeError> {
        self.blocks.best_tip()
    }

    fn block_hash_at(&self, height: u64) -> Result<Option<Hash256>, LodeError> {
        self.blocks.block_hash_at(height)
    }

    fn has_block(&self, hash: &Hash256) -> Result<bool, LodeError> {
        self.blocks.has_block(hash)
    }
}

impl IndexQuery for ChainDb {
    fn tx_location(&self, txid: &Hash256) -> Result<TxLocation, LodeError> {
        self.indexes.tx_location(txid)
    }

    fn txids_for_address(&self, address: &Address) -> Result<Vec<Hash256>, LodeError> {
        self.indexes.txids_for_address(address)
    }
}
