//! Optional secondary indexes and their manager.
//!
//! Each index kind owns one bucket plus a state record in `index_meta`
//! (`version`, `tip`, `dropping`). An index exists iff its record is present
//! and not marked `dropping`. Indexes may depend on each other; the graph in
//! [`IndexKind::dependencies`] drives creation checks and cascading drops.
//!
//! Existing indexes are maintained by [`IndexManager::on_connect`] and
//! [`IndexManager::on_disconnect`], which the block store calls inside its
//! own update. A hook only applies to an index whose tip is exactly the
//! block's parent (connect) or the block itself (disconnect); an index that
//! is behind is brought forward by [`IndexManager::catch_up`].

mod addrindex;
mod txindex;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lode_core::chain::{SpendJournal, SpentOutput, TxLocation};
use lode_core::error::{IndexError, LodeError, StorageError};
use lode_core::types::{Address, Block, Hash256};

use crate::engine::{bucket, Engine, ReadTx, UpdateTx};
use crate::interrupt::Interrupt;
use crate::storage::{journal_slices, read_block, read_hash_at, read_journal, read_tip};

pub use addrindex::AddrIndexer;
pub use txindex::TxIndexer;

/// Keys deleted per update while dropping an index.
const DROP_CHUNK: usize = 10_000;

/// Blocks indexed per update while catching up.
const CATCH_UP_BATCH: u64 = 500;

/// The optional indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// txid -> block location.
    TxIndex,
    /// address -> txids that paid to or spent from it. Requires `TxIndex`.
    AddrIndex,
}

impl IndexKind {
    /// Every kind, dependencies before dependents.
    pub const ALL: [IndexKind; 2] = [IndexKind::TxIndex, IndexKind::AddrIndex];

    pub fn name(self) -> &'static str {
        match self {
            IndexKind::TxIndex => "transaction index",
            IndexKind::AddrIndex => "address index",
        }
    }

    /// Key of the state record in `index_meta`.
    fn meta_key(self) -> &'static [u8] {
        match self {
            IndexKind::TxIndex => b"txindex",
            IndexKind::AddrIndex => b"addrindex",
        }
    }

    /// Bucket holding the index's entries.
    pub fn bucket(self) -> &'static str {
        match self {
            IndexKind::TxIndex => bucket::TX_INDEX,
            IndexKind::AddrIndex => bucket::ADDR_INDEX,
        }
    }

    /// Kinds that must exist before this one can be created.
    pub fn dependencies(self) -> &'static [IndexKind] {
        match self {
            IndexKind::TxIndex => &[],
            IndexKind::AddrIndex => &[IndexKind::TxIndex],
        }
    }

    /// Kinds that directly depend on this one.
    pub fn dependents(self) -> Vec<IndexKind> {
        Self::ALL
            .into_iter()
            .filter(|k| k.dependencies().contains(&self))
            .collect()
    }

    /// This kind plus everything that transitively depends on it,
    /// dependents first.
    pub fn drop_order(self) -> Vec<IndexKind> {
        let mut order = Vec::new();
        self.push_drop_order(&mut order);
        order
    }

    fn push_drop_order(self, order: &mut Vec<IndexKind>) {
        for dependent in self.dependents() {
            dependent.push_drop_order(order);
        }
        if !order.contains(&self) {
            order.push(self);
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last block an index has applied.
#[derive(bincode::Encode, bincode::Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexTip {
    pub hash: Hash256,
    pub height: u64,
}

/// Persistent state of one index.
#[derive(bincode::Encode, bincode::Decode, Clone, Debug, PartialEq, Eq)]
pub struct IndexState {
    /// Record format version the index was built with.
    pub version: u32,
    /// `None` until the genesis block has been indexed.
    pub tip: Option<IndexTip>,
    /// Set while a drop is in progress; the index no longer exists.
    pub dropping: bool,
}

impl IndexState {
    fn tip_hash(&self) -> Hash256 {
        self.tip.map(|t| t.hash).unwrap_or(Hash256::ZERO)
    }
}

/// Maintenance hooks of one index kind.
pub trait Indexer: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Record format version. A stored index with another version is rebuilt.
    fn version(&self) -> u32;

    /// Add the entries for `block`. `spent` holds the block's journal split
    /// per transaction.
    fn connect_block(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        hash: &Hash256,
        height: u64,
        spent: &[&[SpentOutput]],
    ) -> Result<(), LodeError>;

    /// Remove exactly the entries `connect_block` added for `block`.
    fn disconnect_block(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        hash: &Hash256,
        height: u64,
        spent: &[&[SpentOutput]],
    ) -> Result<(), LodeError>;
}

fn read_state(r: &impl ReadTx, kind: IndexKind) -> Result<Option<IndexState>, LodeError> {
    r.get_decoded(bucket::INDEX_META, kind.meta_key())
}

fn live_state(r: &impl ReadTx, kind: IndexKind) -> Result<Option<IndexState>, LodeError> {
    Ok(read_state(r, kind)?.filter(|s| !s.dropping))
}

/// Owns the index hooks and every index state transition.
pub struct IndexManager {
    engine: Arc<Engine>,
    chain_lock: Arc<Mutex<()>>,
    /// In [`IndexKind::ALL`] order.
    indexers: Vec<Box<dyn Indexer>>,
}

impl IndexManager {
    pub fn new(engine: Arc<Engine>, chain_lock: Arc<Mutex<()>>) -> Self {
        let indexers: Vec<Box<dyn Indexer>> = vec![Box::new(TxIndexer), Box::new(AddrIndexer)];
        Self {
            engine,
            chain_lock,
            indexers,
        }
    }

    fn indexer(&self, kind: IndexKind) -> &dyn Indexer {
        // `new` registers one indexer per kind, in `IndexKind::ALL` order.
        let position = IndexKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
        self.indexers[position].as_ref()
    }

    /// Whether `kind` exists.
    pub fn has_index(&self, kind: IndexKind) -> Result<bool, LodeError> {
        self.engine.view(|v| Ok(live_state(v, kind)?.is_some()))
    }

    /// Raw state record of `kind`, including one marked `dropping`.
    pub fn index_state(&self, kind: IndexKind) -> Result<Option<IndexState>, LodeError> {
        self.engine.view(|v| read_state(v, kind))
    }

    /// Create an empty index. It starts with no tip and is filled by
    /// [`catch_up`](Self::catch_up). Returns `false` if it already exists.
    ///
    /// # Errors
    ///
    /// - [`IndexError::Dependency`] if a dependency does not exist
    /// - [`IndexError::DropPending`] if a drop of `kind` has not finished
    pub fn create_index(&self, kind: IndexKind) -> Result<bool, LodeError> {
        let _chain = self.chain_lock.lock();
        self.create_locked(kind)
    }

    fn create_locked(&self, kind: IndexKind) -> Result<bool, LodeError> {
        let version = self.indexer(kind).version();
        let created = self.engine.update(|u| {
            match read_state(&*u, kind)? {
                Some(state) if state.dropping => return Err(IndexError::DropPending(kind.name()).into()),
                Some(_) => return Ok(false),
                None => {}
            }
            for dependency in kind.dependencies() {
                if live_state(&*u, *dependency)?.is_none() {
                    return Err(IndexError::Dependency {
                        index: kind.name(),
                        requires: dependency.name(),
                    }
                    .into());
                }
            }
            let state = IndexState {
                version,
                tip: None,
                dropping: false,
            };
            u.put_encoded(bucket::INDEX_META, kind.meta_key(), &state)?;
            Ok(true)
        })?;
        if created {
            info!(index = %kind, "index created");
        }
        Ok(created)
    }

    /// Drop `kind` and every index depending on it. Returns `false` if none
    /// of them existed.
    ///
    /// All affected indexes stop existing in the first update; their entries
    /// are then deleted in chunks with an interrupt check before each. An
    /// interrupted drop is finished by
    /// [`resume_pending_drops`](Self::resume_pending_drops). Holds the chain
    /// lock, so a drop never interleaves with a rebuild or a catch-up.
    pub fn drop_index(&self, kind: IndexKind, interrupt: &Interrupt) -> Result<bool, LodeError> {
        let _chain = self.chain_lock.lock();
        self.drop_locked(kind, interrupt)
    }

    fn drop_locked(&self, kind: IndexKind, interrupt: &Interrupt) -> Result<bool, LodeError> {
        let order = kind.drop_order();
        let marked = self.engine.update(|u| {
            let mut marked = Vec::new();
            for k in &order {
                if let Some(mut state) = read_state(&*u, *k)? {
                    if !state.dropping {
                        state.dropping = true;
                        u.put_encoded(bucket::INDEX_META, k.meta_key(), &state)?;
                    }
                    marked.push(*k);
                }
            }
            Ok(marked)
        })?;
        if marked.is_empty() {
            debug!(index = %kind, "nothing to drop");
            return Ok(false);
        }
        self.finish_drops(&marked, interrupt)?;
        Ok(true)
    }

    /// Finish drops left unfinished by an earlier run. Returns the kinds
    /// that were dropped.
    pub fn resume_pending_drops(&self, interrupt: &Interrupt) -> Result<Vec<IndexKind>, LodeError> {
        let _chain = self.chain_lock.lock();
        let pending = self.engine.view(|v| {
            let mut pending = Vec::new();
            for kind in IndexKind::ALL.into_iter().rev() {
                if read_state(v, kind)?.is_some_and(|s| s.dropping) {
                    pending.push(kind);
                }
            }
            Ok(pending)
        })?;
        if !pending.is_empty() {
            warn!(count = pending.len(), "resuming interrupted index drop");
            self.finish_drops(&pending, interrupt)?;
        }
        Ok(pending)
    }

    fn finish_drops(&self, kinds: &[IndexKind], interrupt: &Interrupt) -> Result<(), LodeError> {
        for kind in kinds {
            info!(index = %kind, "dropping index");
            let mut deleted = 0usize;
            loop {
                interrupt.check()?;
                let chunk = self.engine.update(|u| {
                    let keys = u.first_keys(kind.bucket(), DROP_CHUNK)?;
                    let n = keys.len();
                    for key in keys {
                        u.delete(kind.bucket(), key);
                    }
                    Ok(n)
                })?;
                if chunk == 0 {
                    break;
                }
                deleted += chunk;
                debug!(index = %kind, deleted, "drop progress");
            }
            self.engine.update(|u| {
                u.delete(bucket::INDEX_META, kind.meta_key());
                Ok(())
            })?;
            info!(index = %kind, deleted, "index dropped");
        }
        Ok(())
    }

    /// Drop `kind` (and its dependents), recreate it together with the
    /// dependents that existed, and index the whole best chain. Holds the
    /// chain lock throughout so no block is connected meanwhile.
    pub fn rebuild_index(&self, kind: IndexKind, interrupt: &Interrupt) -> Result<(), LodeError> {
        let _chain = self.chain_lock.lock();
        for dependency in kind.dependencies() {
            if !self.has_index(*dependency)? {
                return Err(IndexError::Dependency {
                    index: kind.name(),
                    requires: dependency.name(),
                }
                .into());
            }
        }
        let mut recreate = vec![kind];
        for k in kind.drop_order() {
            if k != kind && self.has_index(k)? {
                recreate.push(k);
            }
        }
        self.drop_locked(kind, interrupt)?;
        for k in IndexKind::ALL {
            if recreate.contains(&k) {
                self.create_locked(k)?;
            }
        }
        self.catch_up_locked(interrupt)?;
        info!(index = %kind, "index rebuilt");
        Ok(())
    }

    /// Bring every existing index up to the chain tip.
    pub fn catch_up(&self, interrupt: &Interrupt) -> Result<(), LodeError> {
        let _chain = self.chain_lock.lock();
        self.catch_up_locked(interrupt)
    }

    fn catch_up_locked(&self, interrupt: &Interrupt) -> Result<(), LodeError> {
        self.reset_stale(interrupt)?;
        loop {
            interrupt.check()?;
            let batch = self.engine.update(|u| {
                let Some(chain_tip) = read_tip(&*u)? else {
                    return Ok(None);
                };
                let mut start: Option<u64> = None;
                for kind in IndexKind::ALL {
                    let next = match live_state(&*u, kind)? {
                        Some(state) => match state.tip {
                            None => Some(0),
                            Some(tip) if tip.height < chain_tip.height => Some(tip.height + 1),
                            Some(_) => None,
                        },
                        None => None,
                    };
                    start = match (start, next) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                let Some(start) = start else {
                    return Ok(None);
                };
                let end = chain_tip.height.min(start + CATCH_UP_BATCH - 1);
                let mut applied = 0usize;
                for height in start..=end {
                    let hash = read_hash_at(&*u, height)?.ok_or_else(|| StorageError::Corrupt {
                        bucket: bucket::HEIGHT_INDEX.to_string(),
                        key: hex::encode(height.to_be_bytes()),
                        reason: "best chain has a gap".into(),
                    })?;
                    let block = read_block(&*u, &hash)?;
                    let record = read_journal(&*u, &hash)?;
                    applied += self.apply_connect(u, &block, &hash, height, &record.journal)?;
                }
                Ok(Some((start, end, chain_tip.height, applied)))
            })?;
            match batch {
                None => return Ok(()),
                Some((start, end, tip, 0)) => {
                    warn!(start, end, tip, "index catch-up made no progress");
                    return Ok(());
                }
                Some((start, end, tip, _)) => {
                    info!(from = start, to = end, tip, "indexes catching up");
                }
            }
        }
    }

    /// Rebuild from scratch any index that hooks can no longer advance: one
    /// built with another record version, or one whose tip left the best
    /// chain.
    fn reset_stale(&self, interrupt: &Interrupt) -> Result<(), LodeError> {
        let stale = self.engine.view(|v| {
            let mut stale = Vec::new();
            for indexer in &self.indexers {
                let kind = indexer.kind();
                let Some(state) = live_state(v, kind)? else {
                    continue;
                };
                let off_chain = match state.tip {
                    Some(tip) => read_hash_at(v, tip.height)? != Some(tip.hash),
                    None => false,
                };
                if state.version != indexer.version() || off_chain {
                    stale.push(kind);
                }
            }
            Ok(stale)
        })?;
        for kind in stale {
            if !self.has_index(kind)? {
                continue;
            }
            warn!(index = %kind, "index is stale; rebuilding from genesis");
            let mut recreate = vec![kind];
            for k in kind.drop_order() {
                if k != kind && self.has_index(k)? {
                    recreate.push(k);
                }
            }
            self.drop_locked(kind, interrupt)?;
            for k in IndexKind::ALL {
                if recreate.contains(&k) {
                    self.create_locked(k)?;
                }
            }
        }
        Ok(())
    }

    /// Block store hook: `block` at `height` became the tip inside `u`.
    pub fn on_connect(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        hash: &Hash256,
        height: u64,
        journal: &SpendJournal,
    ) -> Result<(), LodeError> {
        self.apply_connect(u, block, hash, height, journal).map(|_| ())
    }

    /// Returns how many indexes took the block.
    fn apply_connect(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        hash: &Hash256,
        height: u64,
        journal: &SpendJournal,
    ) -> Result<usize, LodeError> {
        let slices = journal_slices(block, journal)?;
        let mut applied = 0;
        for indexer in &self.indexers {
            let kind = indexer.kind();
            let Some(mut state) = live_state(&*u, kind)? else {
                continue;
            };
            if state.tip_hash() != block.header.prev_hash {
                debug!(index = %kind, height, "index not at parent; skipping block");
                continue;
            }
            indexer.connect_block(u, block, hash, height, &slices)?;
            state.tip = Some(IndexTip { hash: *hash, height });
            u.put_encoded(bucket::INDEX_META, kind.meta_key(), &state)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Block store hook: `block` at `height` stopped being the tip inside `u`.
    pub fn on_disconnect(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        hash: &Hash256,
        height: u64,
        journal: &SpendJournal,
    ) -> Result<(), LodeError> {
        let slices = journal_slices(block, journal)?;
        // Dependents first.
        for indexer in self.indexers.iter().rev() {
            let kind = indexer.kind();
            let Some(mut state) = live_state(&*u, kind)? else {
                continue;
            };
            if state.tip_hash() != *hash {
                debug!(index = %kind, height, "index not at block; skipping disconnect");
                continue;
            }
            indexer.disconnect_block(u, block, hash, height, &slices)?;
            state.tip = if block.header.is_genesis() {
                None
            } else {
                Some(IndexTip {
                    hash: block.header.prev_hash,
                    height: height.saturating_sub(1),
                })
            };
            u.put_encoded(bucket::INDEX_META, kind.meta_key(), &state)?;
        }
        Ok(())
    }

    /// Fail unless `kind` exists and has indexed up to the chain tip.
    fn require_current(&self, r: &impl ReadTx, kind: IndexKind) -> Result<(), LodeError> {
        let state = live_state(r, kind)?.ok_or(IndexError::NotEnabled(kind.name()))?;
        let chain_tip = read_tip(r)?.map(|t| t.hash).unwrap_or(Hash256::ZERO);
        if state.tip_hash() != chain_tip {
            return Err(IndexError::Behind(kind.name()).into());
        }
        Ok(())
    }

    /// Location of a confirmed transaction.
    pub fn tx_location(&self, txid: &Hash256) -> Result<TxLocation, LodeError> {
        self.engine.view(|v| self.tx_location_in(v, txid))
    }

    pub(crate) fn tx_location_in(&self, r: &impl ReadTx, txid: &Hash256) -> Result<TxLocation, LodeError> {
        self.require_current(r, IndexKind::TxIndex)?;
        r.get_decoded(bucket::TX_INDEX, txid.as_ref())?
            .ok_or_else(|| IndexError::TxNotFound(txid.to_string()).into())
    }

    /// Transactions that paid to or spent from `address`, in chain order.
    pub fn txids_for_address(&self, address: &Address) -> Result<Vec<Hash256>, LodeError> {
        self.engine.view(|v| {
            self.require_current(v, IndexKind::AddrIndex)?;
            addrindex::txids_for(v, address)
        })
    }
}
