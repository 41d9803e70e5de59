//! Block store: block records, the chain index, the best-chain tip, spend
//! journals and the unspent output set.
//!
//! Every mutation is a single [`Engine::update`], so a block is either fully
//! connected (unspent set, journal, height index, status, tip and index
//! entries) or not at all. Block records are immutable once stored and stay
//! fetchable after their block is disconnected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use lode_core::chain::{
    BlockStatus, ChainIndexEntry, ChainTip, ConnectBlockResult, DisconnectBlockResult,
    SpendJournal, SpentOutput, TxLocation,
};
use lode_core::error::{ChainStateError, LodeError, StorageError};
use lode_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, UtxoEntry};

use crate::engine::{bucket, Engine, ReadTx};
use crate::indexers::IndexManager;

// --- Metadata keys ---

pub const META_CHAIN_TIP: &[u8] = b"chain_tip";
pub const META_UTXO_COUNT: &[u8] = b"utxo_count";

/// Stored form of a spend journal. Carries the block's chain index status
/// from before it was connected so a disconnect restores it exactly.
#[derive(bincode::Encode, bincode::Decode, Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    pub prior_status: BlockStatus,
    pub journal: SpendJournal,
}

/// Encode a height as big-endian bytes for ordered iteration.
pub(crate) fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

pub(crate) fn read_tip(r: &impl ReadTx) -> Result<Option<ChainTip>, LodeError> {
    r.get_decoded(bucket::METADATA, META_CHAIN_TIP)
}

pub(crate) fn read_entry(r: &impl ReadTx, hash: &Hash256) -> Result<Option<ChainIndexEntry>, LodeError> {
    r.get_decoded(bucket::CHAIN_INDEX, hash.as_ref())
}

pub(crate) fn read_hash_at(r: &impl ReadTx, height: u64) -> Result<Option<Hash256>, LodeError> {
    let key = height_key(height);
    match r.get(bucket::HEIGHT_INDEX, &key)? {
        Some(bytes) => Hash256::from_slice(&bytes).map(Some).ok_or_else(|| {
            StorageError::Corrupt {
                bucket: bucket::HEIGHT_INDEX.to_string(),
                key: hex::encode(key),
                reason: format!("expected 32-byte block id, got {} bytes", bytes.len()),
            }
            .into()
        }),
        None => Ok(None),
    }
}

pub(crate) fn read_block(r: &impl ReadTx, hash: &Hash256) -> Result<Block, LodeError> {
    r.get_decoded(bucket::BLOCKS, hash.as_ref())?
        .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()).into())
}

pub(crate) fn read_journal(r: &impl ReadTx, hash: &Hash256) -> Result<JournalRecord, LodeError> {
    r.get_decoded(bucket::SPEND_JOURNAL, hash.as_ref())?
        .ok_or_else(|| ChainStateError::SpendJournalMissing(hash.to_string()).into())
}

fn read_utxo_count(r: &impl ReadTx) -> Result<u64, LodeError> {
    match r.get(bucket::METADATA, META_UTXO_COUNT)? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StorageError::Corrupt {
                bucket: bucket::METADATA.to_string(),
                key: hex::encode(META_UTXO_COUNT),
                reason: "invalid metadata value length".into(),
            })?;
            Ok(u64::from_le_bytes(arr))
        }
        None => Ok(0),
    }
}

/// Split a block's journal into one slice per transaction, in block order.
/// Coinbase transactions get an empty slice.
pub(crate) fn journal_slices<'a>(
    block: &Block,
    journal: &'a SpendJournal,
) -> Result<Vec<&'a [SpentOutput]>, ChainStateError> {
    let expected = block.spending_input_count();
    if journal.len() != expected {
        return Err(ChainStateError::SpendJournalMismatch {
            block: block.hash().to_string(),
            expected,
            got: journal.len(),
        });
    }
    let mut rest = journal.spent.as_slice();
    let mut slices = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let (head, tail) = rest.split_at(tx.spending_input_count());
        slices.push(head);
        rest = tail;
    }
    Ok(slices)
}

/// Persistent block chain storage on top of the engine.
///
/// Mutations hold the chain lock, which index rebuilds also take so the
/// chain cannot move under a backfill.
pub struct BlockStore {
    engine: Arc<Engine>,
    indexes: Arc<IndexManager>,
    chain_lock: Arc<Mutex<()>>,
}

impl BlockStore {
    pub fn new(engine: Arc<Engine>, indexes: Arc<IndexManager>, chain_lock: Arc<Mutex<()>>) -> Self {
        Self {
            engine,
            indexes,
            chain_lock,
        }
    }

    /// Store a block record and its chain index entry. Returns `false` if it
    /// was already stored.
    pub fn put_block(&self, block: &Block) -> Result<bool, LodeError> {
        let _chain = self.chain_lock.lock();
        let hash = block.hash();
        let stored = self.engine.update(|u| {
            if u.contains(bucket::CHAIN_INDEX, hash.as_ref())? {
                return Ok(false);
            }

            let entry = if block.header.is_genesis() {
                ChainIndexEntry {
                    height: 0,
                    cumulative_work: block.header.work(),
                    status: BlockStatus::Unknown,
                    parent: Hash256::ZERO,
                }
            } else {
                let parent_hash = block.header.prev_hash;
                let parent = read_entry(&*u, &parent_hash)?.ok_or_else(|| ChainStateError::MissingParent {
                    block: hash.to_string(),
                    parent: parent_hash.to_string(),
                })?;
                // Descendants of an invalid block are invalid too.
                let status = match parent.status {
                    BlockStatus::Invalid => BlockStatus::Invalid,
                    _ => BlockStatus::Unknown,
                };
                ChainIndexEntry {
                    height: parent.height + 1,
                    cumulative_work: parent.cumulative_work.saturating_add(block.header.work()),
                    status,
                    parent: parent_hash,
                }
            };

            u.put_encoded(bucket::BLOCKS, hash.0, block)?;
            u.put_encoded(bucket::HEADERS, hash.0, &block.header)?;
            u.put_encoded(bucket::CHAIN_INDEX, hash.0, &entry)?;
            Ok(true)
        })?;
        if stored {
            debug!(%hash, "block stored");
        }
        Ok(stored)
    }

    /// Make a stored block the new tip.
    pub fn connect_block(&self, hash: &Hash256, journal: SpendJournal) -> Result<ConnectBlockResult, LodeError> {
        let _chain = self.chain_lock.lock();
        let result = self.engine.update(|u| {
            let entry = read_entry(&*u, hash)?
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            if entry.status == BlockStatus::Invalid {
                return Err(ChainStateError::InvalidBlock(hash.to_string()).into());
            }
            let expected_parent = read_tip(&*u)?.map(|t| t.hash).unwrap_or(Hash256::ZERO);
            if entry.parent != expected_parent {
                return Err(ChainStateError::ChainLinkage {
                    expected: expected_parent.to_string(),
                    got: entry.parent.to_string(),
                }
                .into());
            }

            let block = read_block(&*u, hash)?;
            let slices = journal_slices(&block, &journal)?;

            let mut created = 0usize;
            for (tx, spent) in block.transactions.iter().zip(&slices) {
                for (input, record) in tx.inputs.iter().zip(spent.iter()) {
                    if input.previous_output != record.outpoint {
                        return Err(ChainStateError::SpendJournalOrder {
                            block: hash.to_string(),
                            outpoint: input.previous_output.to_string(),
                        }
                        .into());
                    }
                    let key = input.previous_output.to_key();
                    if !u.contains(bucket::UTXOS, &key)? {
                        return Err(ChainStateError::MissingUtxo(input.previous_output.to_string()).into());
                    }
                    u.delete(bucket::UTXOS, key);
                }

                let txid = tx.txid()?;
                for (index, output) in tx.outputs.iter().enumerate() {
                    let outpoint = OutPoint {
                        txid,
                        index: index as u64,
                    };
                    let utxo = UtxoEntry {
                        output: output.clone(),
                        block_height: entry.height,
                        is_coinbase: tx.is_coinbase(),
                    };
                    u.put_encoded(bucket::UTXOS, outpoint.to_key(), &utxo)?;
                    created += 1;
                }
            }
            let spent = journal.len();

            let count = read_utxo_count(&*u)?;
            let count = (count + created as u64).saturating_sub(spent as u64);
            u.put(bucket::METADATA, META_UTXO_COUNT, count.to_le_bytes());

            self.indexes.on_connect(u, &block, hash, entry.height, &journal)?;

            let tip = ChainTip {
                hash: *hash,
                height: entry.height,
                cumulative_work: entry.cumulative_work,
            };
            u.put_encoded(
                bucket::SPEND_JOURNAL,
                hash.0,
                &JournalRecord {
                    prior_status: entry.status,
                    journal,
                },
            )?;
            u.put(bucket::HEIGHT_INDEX, height_key(tip.height), hash.0);
            u.put_encoded(
                bucket::CHAIN_INDEX,
                hash.0,
                &ChainIndexEntry {
                    status: BlockStatus::Valid,
                    ..entry
                },
            )?;
            u.put_encoded(bucket::METADATA, META_CHAIN_TIP, &tip)?;

            Ok(ConnectBlockResult {
                tip,
                utxos_created: created,
                utxos_spent: spent,
            })
        })?;
        info!(
            hash = %result.tip.hash,
            height = result.tip.height,
            created = result.utxos_created,
            spent = result.utxos_spent,
            "block connected"
        );
        Ok(result)
    }

    /// Undo the tip block, making its parent the tip again.
    pub fn disconnect_tip(&self) -> Result<DisconnectBlockResult, LodeError> {
        let _chain = self.chain_lock.lock();
        let result = self.engine.update(|u| {
            let tip = read_tip(&*u)?.ok_or(ChainStateError::EmptyChain)?;
            if tip.height == 0 {
                return Err(ChainStateError::EmptyChain.into());
            }
            let hash = tip.hash;
            let block = read_block(&*u, &hash)?;
            let entry = read_entry(&*u, &hash)?
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            let parent = read_entry(&*u, &entry.parent)?
                .ok_or_else(|| ChainStateError::BlockNotFound(entry.parent.to_string()))?;
            let record = read_journal(&*u, &hash)?;
            let slices = journal_slices(&block, &record.journal)?;

            self.indexes.on_disconnect(u, &block, &hash, tip.height, &record.journal)?;

            // Newest transaction first, so outputs created and spent inside
            // the block end up absent again.
            let mut removed = 0usize;
            let mut restored = 0usize;
            for (tx, spent) in block.transactions.iter().zip(&slices).rev() {
                let txid = tx.txid()?;
                for index in 0..tx.outputs.len() {
                    let key = OutPoint {
                        txid,
                        index: index as u64,
                    }
                    .to_key();
                    if u.contains(bucket::UTXOS, &key)? {
                        u.delete(bucket::UTXOS, key);
                        removed += 1;
                    }
                }
                for record in spent.iter() {
                    u.put_encoded(bucket::UTXOS, record.outpoint.to_key(), &record.entry)?;
                    restored += 1;
                }
            }

            let count = read_utxo_count(&*u)?;
            let count = (count + restored as u64).saturating_sub(removed as u64);
            u.put(bucket::METADATA, META_UTXO_COUNT, count.to_le_bytes());

            let new_tip = ChainTip {
                hash: entry.parent,
                height: parent.height,
                cumulative_work: parent.cumulative_work,
            };
            u.delete(bucket::SPEND_JOURNAL, hash.0);
            u.delete(bucket::HEIGHT_INDEX, height_key(tip.height));
            u.put_encoded(
                bucket::CHAIN_INDEX,
                hash.0,
                &ChainIndexEntry {
                    status: record.prior_status,
                    ..entry
                },
            )?;
            u.put_encoded(bucket::METADATA, META_CHAIN_TIP, &new_tip)?;

            Ok(DisconnectBlockResult {
                disconnected: hash,
                tip: new_tip,
                utxos_restored: restored,
                utxos_removed: removed,
            })
        })?;
        info!(
            hash = %result.disconnected,
            new_tip = %result.tip.hash,
            height = result.tip.height,
            "block disconnected"
        );
        Ok(result)
    }

    /// Record a validation verdict. Best-chain blocks must stay `Valid`.
    pub fn set_block_status(&self, hash: &Hash256, status: BlockStatus) -> Result<(), LodeError> {
        let _chain = self.chain_lock.lock();
        self.engine.update(|u| {
            let entry = read_entry(&*u, hash)?
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            if entry.status == status {
                return Ok(());
            }
            if status != BlockStatus::Valid && read_hash_at(&*u, entry.height)? == Some(*hash) {
                return Err(ChainStateError::TipStatus(hash.to_string()).into());
            }
            u.put_encoded(bucket::CHAIN_INDEX, hash.0, &ChainIndexEntry { status, ..entry })
        })?;
        debug!(%hash, %status, "block status updated");
        Ok(())
    }

    pub fn fetch_block(&self, hash: &Hash256) -> Result<Block, LodeError> {
        self.engine.view(|v| read_block(v, hash))
    }

    pub fn fetch_header(&self, hash: &Hash256) -> Result<BlockHeader, LodeError> {
        self.engine.view(|v| {
            v.get_decoded(bucket::HEADERS, hash.as_ref())?
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()).into())
        })
    }

    pub fn chain_entry(&self, hash: &Hash256) -> Result<Option<ChainIndexEntry>, LodeError> {
        self.engine.view(|v| read_entry(v, hash))
    }

    pub fn best_tip(&self) -> Result<Option<ChainTip>, LodeError> {
        self.engine.view(|v| read_tip(v))
    }

    pub fn block_hash_at(&self, height: u64) -> Result<Option<Hash256>, LodeError> {
        self.engine.view(|v| read_hash_at(v, height))
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, LodeError> {
        self.engine.view(|v| v.contains(bucket::CHAIN_INDEX, hash.as_ref()))
    }

    /// Unspent output by outpoint.
    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, LodeError> {
        self.engine
            .view(|v| v.get_decoded(bucket::UTXOS, &outpoint.to_key()))
    }

    /// Number of unspent outputs.
    pub fn utxo_count(&self) -> Result<u64, LodeError> {
        self.engine.view(|v| read_utxo_count(v))
    }

    /// The most recent best-chain ancestor of `hash` (the block itself if it
    /// is on the best chain), as `(hash, height)`. `None` if the block's
    /// ancestry never meets the best chain.
    pub fn fork_point(&self, hash: &Hash256) -> Result<Option<(Hash256, u64)>, LodeError> {
        self.engine.view(|v| {
            let mut current = *hash;
            loop {
                let entry = read_entry(v, &current)?
                    .ok_or_else(|| ChainStateError::BlockNotFound(current.to_string()))?;
                if read_hash_at(v, entry.height)? == Some(current) {
                    return Ok(Some((current, entry.height)));
                }
                if entry.parent.is_zero() {
                    return Ok(None);
                }
                current = entry.parent;
            }
        })
    }

    /// Derive the spend journal `block` would need to connect on top of the
    /// current unspent set.
    pub fn build_spend_journal(&self, block: &Block) -> Result<SpendJournal, LodeError> {
        self.engine.view(|v| {
            let height = if block.header.is_genesis() {
                0
            } else {
                let parent = read_entry(v, &block.header.prev_hash)?.ok_or_else(|| {
                    ChainStateError::MissingParent {
                        block: block.hash().to_string(),
                        parent: block.header.prev_hash.to_string(),
                    }
                })?;
                parent.height + 1
            };

            // Outputs created earlier in this block are spendable by later
            // transactions in it.
            let mut created: HashMap<[u8; 40], UtxoEntry> = HashMap::new();
            let mut spent = Vec::with_capacity(block.spending_input_count());
            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        let key = input.previous_output.to_key();
                        let entry = match created.remove(&key) {
                            Some(entry) => entry,
                            None => v
                                .get_decoded::<UtxoEntry>(bucket::UTXOS, &key)?
                                .ok_or_else(|| ChainStateError::MissingUtxo(input.previous_output.to_string()))?,
                        };
                        spent.push(SpentOutput {
                            outpoint: input.previous_output.clone(),
                            entry,
                        });
                    }
                }
                let txid = tx.txid()?;
                for (index, output) in tx.outputs.iter().enumerate() {
                    let key = OutPoint {
                        txid,
                        index: index as u64,
                    }
                    .to_key();
                    created.insert(
                        key,
                        UtxoEntry {
                            output: output.clone(),
                            block_height: height,
                            is_coinbase: tx.is_coinbase(),
                        },
                    );
                }
            }
            Ok(SpendJournal::new(spent))
        })
    }

    /// A confirmed transaction and its location, via the transaction index.
    pub fn fetch_transaction(&self, txid: &Hash256) -> Result<(Transaction, TxLocation), LodeError> {
        self.engine.view(|v| {
            let location = self.indexes.tx_location_in(v, txid)?;
            let block = read_block(v, &location.block_hash)?;
            let tx = block
                .transactions
                .into_iter()
                .nth(location.offset as usize)
                .ok_or_else(|| StorageError::Corrupt {
                    bucket: bucket::TX_INDEX.to_string(),
                    key: txid.to_string(),
                    reason: format!("offset {} outside block {}", location.offset, location.block_hash),
                })?;
            Ok((tx, location))
        })
    }

    /// Store and connect `genesis` if the chain is empty. Returns whether it
    /// was connected.
    pub fn ensure_genesis(&self, genesis: &Block) -> Result<bool, LodeError> {
        if self.best_tip()?.is_some() {
            return Ok(false);
        }
        let hash = genesis.hash();
        self.put_block(genesis)?;
        let journal = self.build_spend_journal(genesis)?;
        self.connect_block(&hash, journal)?;
        info!(%hash, "genesis block connected");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ChainDb;
    use crate::engine::EngineConfig;
    use crate::interrupt::Interrupt;
    use lode_core::genesis;
    use lode_core::merkle;
    use lode_core::types::{TxInput, TxOutput};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_db() -> (ChainDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path().join("chaindata"), &EngineConfig::default(), &Interrupt::never()).unwrap();
        (db, dir)
    }

    fn genesis_db() -> (ChainDb, tempfile::TempDir) {
        let (db, dir) = temp_db();
        db.blocks().ensure_genesis(genesis::genesis_block()).unwrap();
        (db, dir)
    }

    /// Coinbase with `lock_time: height` so coinbases at different heights
    /// have distinct txids.
    fn make_coinbase(value: u64, pubkey_hash: Hash256, height: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: height.to_le_bytes().to_vec(),
                public_key: vec![],
            }],
            outputs: vec![TxOutput { value, pubkey_hash }],
            lock_time: height,
        }
    }

    fn make_tx(outpoints: &[OutPoint], output_value: u64, pubkey_hash: Hash256) -> Transaction {
        Transaction {
            version: 1,
            inputs: outpoints
                .iter()
                .map(|op| TxInput {
                    previous_output: op.clone(),
                    signature: vec![0; 64],
                    public_key: vec![0; 32],
                })
                .collect(),
            outputs: vec![TxOutput {
                value: output_value,
                pubkey_hash,
            }],
            lock_time: 0,
        }
    }

    fn make_block(prev_hash: Hash256, timestamp: u64, txs: Vec<Transaction>) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid().unwrap()).collect();
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: merkle::merkle_root(&txids),
                timestamp,
                difficulty_target: u64::MAX,
                nonce: 0,
            },
            transactions: txs,
        }
    }

    fn pkh(seed: u8) -> Hash256 {
        Hash256([seed; 32])
    }

    fn outpoint(tx: &Transaction, index: u64) -> OutPoint {
        OutPoint {
            txid: tx.txid().unwrap(),
            index,
        }
    }

    /// Store and connect a block on the current tip.
    fn connect(db: &ChainDb, block: &Block) -> ConnectBlockResult {
        let store = db.blocks();
        store.put_block(block).unwrap();
        let journal = store.build_spend_journal(block).unwrap();
        store.connect_block(&block.hash(), journal).unwrap()
    }

    fn child_of_genesis(seed: u8) -> Block {
        make_block(
            genesis::genesis_hash(),
            genesis::GENESIS_TIMESTAMP + 60,
            vec![make_coinbase(50, pkh(seed), 1)],
        )
    }

    // ------------------------------------------------------------------
    // put_block
    // ------------------------------------------------------------------

    #[test]
    fn put_block_creates_unknown_entry() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        assert!(db.blocks().put_block(&b1).unwrap());

        let entry = db.blocks().chain_entry(&b1.hash()).unwrap().unwrap();
        assert_eq!(entry.height, 1);
        assert_eq!(entry.status, BlockStatus::Unknown);
        assert_eq!(entry.parent, genesis::genesis_hash());
        assert_eq!(entry.cumulative_work, 2);
        // Never promotes the tip.
        assert_eq!(db.blocks().best_tip().unwrap().unwrap().hash, genesis::genesis_hash());
    }

    #[test]
    fn put_block_is_idempotent() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        assert!(db.blocks().put_block(&b1).unwrap());
        let before = db.engine().dump().unwrap();
        assert!(!db.blocks().put_block(&b1).unwrap());
        assert_eq!(db.engine().dump().unwrap(), before);
    }

    #[test]
    fn put_block_rejects_missing_parent() {
        let (db, _dir) = genesis_db();
        let orphan = make_block(pkh(0xEE), 1, vec![make_coinbase(50, pkh(1), 9)]);
        let err = db.blocks().put_block(&orphan).unwrap_err();
        assert!(matches!(
            err,
            LodeError::ChainState(ChainStateError::MissingParent { .. })
        ));
        assert!(!db.blocks().has_block(&orphan.hash()).unwrap());
    }

    #[test]
    fn put_block_accumulates_work() {
        let (db, _dir) = genesis_db();
        let mut b1 = child_of_genesis(1);
        b1.header.difficulty_target = u64::MAX / 4;
        db.blocks().put_block(&b1).unwrap();
        let entry = db.blocks().chain_entry(&b1.hash()).unwrap().unwrap();
        assert_eq!(entry.cumulative_work, 1 + b1.header.work());
    }

    #[test]
    fn child_of_invalid_block_is_invalid() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        db.blocks().put_block(&b1).unwrap();
        db.blocks().set_block_status(&b1.hash(), BlockStatus::Invalid).unwrap();

        let b2 = make_block(b1.hash(), 2, vec![make_coinbase(50, pkh(2), 2)]);
        db.blocks().put_block(&b2).unwrap();
        let entry = db.blocks().chain_entry(&b2.hash()).unwrap().unwrap();
        assert_eq!(entry.status, BlockStatus::Invalid);
    }

    // ------------------------------------------------------------------
    // connect_block
    // ------------------------------------------------------------------

    #[test]
    fn genesis_connects_on_empty_chain() {
        let (db, _dir) = temp_db();
        assert!(db.blocks().best_tip().unwrap().is_none());
        assert!(db.blocks().ensure_genesis(genesis::genesis_block()).unwrap());
        assert!(!db.blocks().ensure_genesis(genesis::genesis_block()).unwrap());

        let tip = db.blocks().best_tip().unwrap().unwrap();
        assert_eq!(tip.hash, genesis::genesis_hash());
        assert_eq!(tip.height, 0);
        assert_eq!(db.blocks().utxo_count().unwrap(), 1);
        assert_eq!(db.blocks().block_hash_at(0).unwrap(), Some(genesis::genesis_hash()));
        let entry = db.blocks().chain_entry(&tip.hash).unwrap().unwrap();
        assert_eq!(entry.status, BlockStatus::Valid);
    }

    #[test]
    fn connect_after_genesis_moves_tip() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        let result = connect(&db, &b1);
        assert_eq!(result.tip.height, 1);
        assert_eq!(result.tip.cumulative_work, 2);
        assert_eq!(result.utxos_created, 1);
        assert_eq!(result.utxos_spent, 0);
        assert_eq!(db.blocks().best_tip().unwrap(), Some(result.tip));
        assert_eq!(db.blocks().utxo_count().unwrap(), 2);
    }

    #[test]
    fn connect_rejects_unknown_block() {
        let (db, _dir) = genesis_db();
        let err = db
            .blocks()
            .connect_block(&pkh(0x42), SpendJournal::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn connect_rejects_non_child_of_tip() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        connect(&db, &b1);

        let sibling = child_of_genesis(2);
        db.blocks().put_block(&sibling).unwrap();
        let err = db
            .blocks()
            .connect_block(&sibling.hash(), SpendJournal::default())
            .unwrap_err();
        match err {
            LodeError::ChainState(ChainStateError::ChainLinkage { expected, got }) => {
                assert_eq!(expected, b1.hash().to_string());
                assert_eq!(got, genesis::genesis_hash().to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn connect_rejects_non_genesis_on_empty_chain() {
        let (db, _dir) = temp_db();
        db.blocks().put_block(genesis::genesis_block()).unwrap();
        let b1 = child_of_genesis(1);
        db.blocks().put_block(&b1).unwrap();
        let err = db
            .blocks()
            .connect_block(&b1.hash(), SpendJournal::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LodeError::ChainState(ChainStateError::ChainLinkage { .. })
        ));
    }

    #[test]
    fn connect_rejects_invalid_block() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        db.blocks().put_block(&b1).unwrap();
        db.blocks().set_block_status(&b1.hash(), BlockStatus::Invalid).unwrap();
        let err = db
            .blocks()
            .connect_block(&b1.hash(), SpendJournal::default())
            .unwrap_err();
        assert!(matches!(err, LodeError::ChainState(ChainStateError::InvalidBlock(_))));
    }

    #[test]
    fn connect_rejects_short_journal() {
        let (db, _dir) = genesis_db();
        let genesis_cb = &genesis::genesis_block().transactions[0];
        let spend = make_tx(&[outpoint(genesis_cb, 0)], 40, pkh(3));
        let b1 = make_block(
            genesis::genesis_hash(),
            2,
            vec![make_coinbase(50, pkh(1), 1), spend],
        );
        db.blocks().put_block(&b1).unwrap();
        let err = db
            .blocks()
            .connect_block(&b1.hash(), SpendJournal::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LodeError::ChainState(ChainStateError::SpendJournalMismatch { expected: 1, got: 0, .. })
        ));
        assert_eq!(db.blocks().best_tip().unwrap().unwrap().height, 0);
    }

    #[test]
    fn connect_rejects_missing_utxo_without_partial_writes() {
        let (db, _dir) = genesis_db();
        let phantom = OutPoint {
            txid: pkh(0x99),
            index: 0,
        };
        let b1 = make_block(
            genesis::genesis_hash(),
            2,
            vec![make_coinbase(50, pkh(1), 1), make_tx(&[phantom.clone()], 1, pkh(2))],
        );
        db.blocks().put_block(&b1).unwrap();
        let journal = SpendJournal::new(vec![SpentOutput {
            outpoint: phantom,
            entry: UtxoEntry {
                output: TxOutput {
                    value: 1,
                    pubkey_hash: pkh(9),
                },
                block_height: 0,
                is_coinbase: false,
            },
        }]);
        let before = db.engine().dump().unwrap();
        let err = db.blocks().connect_block(&b1.hash(), journal).unwrap_err();
        assert!(matches!(err, LodeError::ChainState(ChainStateError::MissingUtxo(_))));
        assert_eq!(db.engine().dump().unwrap(), before);
    }

    #[test]
    fn connect_with_spending_tx_moves_utxo() {
        let (db, _dir) = genesis_db();
        let genesis_cb = genesis::genesis_block().transactions[0].clone();
        let spend = make_tx(&[outpoint(&genesis_cb, 0)], 40, pkh(3));
        let b1 = make_block(
            genesis::genesis_hash(),
            2,
            vec![make_coinbase(50, pkh(1), 1), spend.clone()],
        );
        let result = connect(&db, &b1);
        assert_eq!(result.utxos_spent, 1);
        assert_eq!(result.utxos_created, 2);
        assert!(db.blocks().utxo(&outpoint(&genesis_cb, 0)).unwrap().is_none());
        let created = db.blocks().utxo(&outpoint(&spend, 0)).unwrap().unwrap();
        assert_eq!(created.block_height, 1);
        assert!(!created.is_coinbase);
        assert_eq!(db.blocks().utxo_count().unwrap(), 2);
    }

    // ------------------------------------------------------------------
    // disconnect_tip
    // ------------------------------------------------------------------

    #[test]
    fn disconnect_empty_chain_errors() {
        let (db, _dir) = temp_db();
        assert!(matches!(
            db.blocks().disconnect_tip().unwrap_err(),
            LodeError::ChainState(ChainStateError::EmptyChain)
        ));
    }

    #[test]
    fn disconnect_at_genesis_errors() {
        let (db, _dir) = genesis_db();
        assert!(matches!(
            db.blocks().disconnect_tip().unwrap_err(),
            LodeError::ChainState(ChainStateError::EmptyChain)
        ));
    }

    #[test]
    fn disconnect_restores_parent_and_keeps_record() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        connect(&db, &b1);

        let result = db.blocks().disconnect_tip().unwrap();
        assert_eq!(result.disconnected, b1.hash());
        assert_eq!(result.tip.hash, genesis::genesis_hash());
        assert_eq!(result.utxos_removed, 1);
        assert_eq!(db.blocks().best_tip().unwrap().unwrap().hash, genesis::genesis_hash());
        assert_eq!(db.blocks().block_hash_at(1).unwrap(), None);
        // Still fetchable, back to its pre-connect status.
        assert_eq!(db.blocks().fetch_block(&b1.hash()).unwrap(), b1);
        let entry = db.blocks().chain_entry(&b1.hash()).unwrap().unwrap();
        assert_eq!(entry.status, BlockStatus::Unknown);
    }

    #[test]
    fn connect_disconnect_is_byte_identical() {
        let (db, _dir) = genesis_db();
        let genesis_cb = genesis::genesis_block().transactions[0].clone();
        let b1 = make_block(
            genesis::genesis_hash(),
            2,
            vec![
                make_coinbase(50, pkh(1), 1),
                make_tx(&[outpoint(&genesis_cb, 0)], 40, pkh(3)),
            ],
        );
        db.blocks().put_block(&b1).unwrap();
        let before = db.engine().dump().unwrap();

        let journal = db.blocks().build_spend_journal(&b1).unwrap();
        db.blocks().connect_block(&b1.hash(), journal).unwrap();
        assert_ne!(db.engine().dump().unwrap(), before);
        db.blocks().disconnect_tip().unwrap();
        assert_eq!(db.engine().dump().unwrap(), before);
    }

    #[test]
    fn intra_block_spend_round_trips() {
        let (db, _dir) = genesis_db();
        let genesis_cb = genesis::genesis_block().transactions[0].clone();
        let first = make_tx(&[outpoint(&genesis_cb, 0)], 40, pkh(3));
        let second = make_tx(&[outpoint(&first, 0)], 30, pkh(4));
        let b1 = make_block(
            genesis::genesis_hash(),
            2,
            vec![make_coinbase(50, pkh(1), 1), first.clone(), second.clone()],
        );
        db.blocks().put_block(&b1).unwrap();
        let before = db.engine().dump().unwrap();

        let journal = db.blocks().build_spend_journal(&b1).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.spent[1].entry.block_height, 1);
        connect(&db, &b1);
        assert!(db.blocks().utxo(&outpoint(&first, 0)).unwrap().is_none());
        assert!(db.blocks().utxo(&outpoint(&second, 0)).unwrap().is_some());
        assert_eq!(db.blocks().utxo_count().unwrap(), 2);

        let result = db.blocks().disconnect_tip().unwrap();
        assert_eq!(result.utxos_removed, 3);
        assert_eq!(result.utxos_restored, 2);
        assert_eq!(db.engine().dump().unwrap(), before);
    }

    // ------------------------------------------------------------------
    // Status, queries
    // ------------------------------------------------------------------

    #[test]
    fn best_chain_blocks_cannot_be_invalidated() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        connect(&db, &b1);
        let err = db
            .blocks()
            .set_block_status(&b1.hash(), BlockStatus::Invalid)
            .unwrap_err();
        assert!(matches!(err, LodeError::ChainState(ChainStateError::TipStatus(_))));
        assert!(db.blocks().set_block_status(&b1.hash(), BlockStatus::Valid).is_ok());
    }

    #[test]
    fn fetch_missing_is_not_found() {
        let (db, _dir) = genesis_db();
        assert!(db.blocks().fetch_block(&pkh(7)).unwrap_err().is_not_found());
        assert!(db.blocks().fetch_header(&pkh(7)).unwrap_err().is_not_found());
        assert_eq!(
            db.blocks().fetch_header(&genesis::genesis_hash()).unwrap(),
            genesis::genesis_block().header
        );
    }

    #[test]
    fn fork_point_walks_to_best_chain() {
        let (db, _dir) = genesis_db();
        let b1 = child_of_genesis(1);
        connect(&db, &b1);
        let side1 = child_of_genesis(2);
        let side2 = make_block(side1.hash(), 3, vec![make_coinbase(50, pkh(2), 2)]);
        db.blocks().put_block(&side1).unwrap();
        db.blocks().put_block(&side2).unwrap();

        assert_eq!(
            db.blocks().fork_point(&side2.hash()).unwrap(),
            Some((genesis::genesis_hash(), 0))
        );
        assert_eq!(db.blocks().fork_point(&b1.hash()).unwrap(), Some((b1.hash(), 1)));
        assert!(db.blocks().fork_point(&pkh(5)).unwrap_err().is_not_found());
    }

    #[test]
    fn build_spend_journal_reports_missing_utxo() {
        let (db, _dir) = genesis_db();
        let b1 = make_block(
            genesis::genesis_hash(),
            2,
            vec![
                make_coinbase(50, pkh(1), 1),
                make_tx(&[OutPoint { txid: pkh(8), index: 3 }], 1, pkh(2)),
            ],
        );
        db.blocks().put_block(&b1).unwrap();
        let err = db.blocks().build_spend_journal(&b1).unwrap_err();
        assert!(matches!(err, LodeError::ChainState(ChainStateError::MissingUtxo(_))));
    }

    #[test]
    fn journal_slices_follow_transactions() {
        let genesis_cb = genesis::genesis_block().transactions[0].clone();
        let spend = make_tx(&[outpoint(&genesis_cb, 0)], 40, pkh(3));
        let block = make_block(pkh(1), 2, vec![make_coinbase(50, pkh(1), 1), spend]);
        let journal = SpendJournal::new(vec![SpentOutput {
            outpoint: outpoint(&genesis_cb, 0),
            entry: UtxoEntry {
                output: genesis_cb.outputs[0].clone(),
                block_height: 0,
                is_coinbase: true,
            },
        }]);
        let slices = journal_slices(&block, &journal).unwrap();
        assert_eq!(slices.len(), 2);
        assert!(slices[0].is_empty());
        assert_eq!(slices[1].len(), 1);
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chaindata");
        let b1 = child_of_genesis(1);
        {
            let db = ChainDb::open(&path, &EngineConfig::default(), &Interrupt::never()).unwrap();
            db.blocks().ensure_genesis(genesis::genesis_block()).unwrap();
            connect(&db, &b1);
            db.close().unwrap();
        }
        let db = ChainDb::open(&path, &EngineConfig::default(), &Interrupt::never()).unwrap();
        let tip = db.blocks().best_tip().unwrap().unwrap();
        assert_eq!(tip.hash, b1.hash());
        assert_eq!(tip.height, 1);
        assert_eq!(db.blocks().utxo_count().unwrap(), 2);
    }
}
