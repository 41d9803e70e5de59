//! Shared test helpers for the E2E tests.

use lode_core::chain::{ChainIndexEntry, SpendJournal};
use lode_core::genesis;
use lode_core::merkle;
use lode_core::types::*;
use lode_node_lib::engine::{bucket, decode, Engine, EngineConfig, ReadTx};
use lode_node_lib::storage::{JournalRecord, META_CHAIN_TIP};
use lode_node_lib::upgrade::{self, legacy, DB_DIR};
use lode_node_lib::{ChainDb, Interrupt};

/// Proof-of-work target with one unit of work per block.
pub const EASY: u64 = u64::MAX;
/// Proof-of-work target with two units of work per block.
pub const HARD: u64 = u64::MAX / 2;
/// Proof-of-work target with four units of work per block.
pub const HEAVY: u64 = u64::MAX / 4;

/// Simple pubkey hash from a seed byte.
pub fn pkh(seed: u8) -> Hash256 {
    Hash256([seed; 32])
}

/// Coinbase with a height marker so every height gets a distinct txid.
pub fn make_coinbase(value: u64, pubkey_hash: Hash256, height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: height.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            value,
            pubkey_hash,
        }],
        lock_time: height,
    }
}

/// Create a simple spending transaction (unsigned).
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<(u64, Hash256)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|op| TxInput {
                previous_output: op,
                signature: vec![0; 64],
                public_key: vec![0; 32],
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, pubkey_hash)| TxOutput { value, pubkey_hash })
            .collect(),
        lock_time: 0,
    }
}

/// Create a block with correct merkle root.
pub fn make_block(prev_hash: Hash256, timestamp: u64, target: u64, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid().unwrap()).collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp,
            difficulty_target: target,
            nonce: 0,
        },
        transactions: txs,
    }
}

/// Output `index` of `tx`.
pub fn outpoint(tx: &Transaction, index: u64) -> OutPoint {
    OutPoint {
        txid: tx.txid().unwrap(),
        index,
    }
}

/// Open (and upgrade) the store under `dir`.
pub fn open_db(dir: &tempfile::TempDir) -> ChainDb {
    ChainDb::open(dir.path().join(DB_DIR), &EngineConfig::default(), &Interrupt::never()).unwrap()
}

/// A fresh store with the genesis block connected.
pub fn genesis_db() -> (ChainDb, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    db.blocks().ensure_genesis(genesis::genesis_block()).unwrap();
    (db, dir)
}

/// Build a block on `prev` at `height` paying its coinbase to `miner`, and
/// store it without connecting.
pub fn store_child(
    db: &ChainDb,
    prev: Hash256,
    height: u64,
    target: u64,
    miner: Hash256,
    txs: Vec<Transaction>,
) -> Block {
    let mut transactions = vec![make_coinbase(50, miner, height)];
    transactions.extend(txs);
    let block = make_block(prev, genesis::GENESIS_TIMESTAMP + height * 60, target, transactions);
    db.blocks().put_block(&block).unwrap();
    block
}

/// Connect a stored block on top of the current tip.
pub fn connect(db: &ChainDb, block: &Block) {
    let journal = db.blocks().build_spend_journal(block).unwrap();
    db.blocks().connect_block(&block.hash(), journal).unwrap();
}

/// Store and connect a block on the current tip. The coinbase pays
/// `pkh(height)`.
pub fn extend(db: &ChainDb, target: u64, txs: Vec<Transaction>) -> Block {
    let tip = db.blocks().best_tip().unwrap().unwrap();
    let height = tip.height + 1;
    let block = store_child(db, tip.hash, height, target, pkh(height as u8), txs);
    connect(db, &block);
    block
}

/// Move the best chain to `new_tip`: disconnect down to the fork point,
/// then connect the branch in order.
pub fn reorg_to(db: &ChainDb, new_tip: Hash256) {
    let (fork, _) = db.blocks().fork_point(&new_tip).unwrap().unwrap();
    while db.blocks().best_tip().unwrap().unwrap().hash != fork {
        db.blocks().disconnect_tip().unwrap();
    }
    let mut branch = Vec::new();
    let mut cursor = new_tip;
    while cursor != fork {
        let block = db.blocks().fetch_block(&cursor).unwrap();
        cursor = block.header.prev_hash;
        branch.push(block);
    }
    for block in branch.iter().rev() {
        connect(db, block);
    }
}

/// Rewrite a current-version store into the v1 layout: chain index entries
/// without status, bare spend journals, split tip keys, no version record.
pub fn downgrade_to_v1(engine: &Engine) {
    engine
        .update(|u| {
            for (key, value) in u.prefix_scan(bucket::CHAIN_INDEX, &[])? {
                let entry: ChainIndexEntry = decode(bucket::CHAIN_INDEX, &key, &value)?;
                let old = legacy::ChainIndexEntryV2 {
                    height: entry.height,
                    cumulative_work: entry.cumulative_work,
                    parent: entry.parent,
                };
                u.put_encoded(bucket::CHAIN_INDEX, key, &old)?;
            }
            for (key, value) in u.prefix_scan(bucket::SPEND_JOURNAL, &[])? {
                let record: JournalRecord = decode(bucket::SPEND_JOURNAL, &key, &value)?;
                let journal: SpendJournal = record.journal;
                u.put_encoded(bucket::SPEND_JOURNAL, key, &journal)?;
            }
            let tip: lode_core::chain::ChainTip = u.get_decoded(bucket::METADATA, META_CHAIN_TIP)?.unwrap();
            u.delete(bucket::METADATA, META_CHAIN_TIP);
            u.delete(bucket::METADATA, upgrade::META_SCHEMA_VERSION);
            u.put(bucket::METADATA, legacy::META_TIP_HASH, tip.hash.0);
            u.put(bucket::METADATA, legacy::META_TIP_HEIGHT, tip.height.to_le_bytes());
            Ok(())
        })
        .unwrap();
}
