//! Criterion benchmarks for the block store.
//!
//! Covers: connect_block with both indexes enabled, connect/disconnect
//! round trips, and unspent output lookups.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use lode_core::genesis;
use lode_core::merkle;
use lode_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

use lode_node_lib::engine::EngineConfig;
use lode_node_lib::indexers::IndexKind;
use lode_node_lib::{ChainDb, Interrupt};

fn open_db(dir: &TempDir) -> ChainDb {
    let db = ChainDb::open(dir.path().join("chaindata"), &EngineConfig::default(), &Interrupt::never()).unwrap();
    db.blocks().ensure_genesis(genesis::genesis_block()).unwrap();
    db
}

/// A coinbase-only block on top of the store's current tip.
fn build_block(db: &ChainDb) -> Block {
    let tip = db.blocks().best_tip().unwrap().unwrap();
    let height = tip.height + 1;
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: height.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            value: 50,
            pubkey_hash: Hash256([0xAA; 32]),
        }],
        lock_time: height,
    };
    let txid = coinbase.txid().unwrap();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            merkle_root: merkle::merkle_root(&[txid]),
            timestamp: genesis::GENESIS_TIMESTAMP + height * 60,
            difficulty_target: u64::MAX,
            nonce: 0,
        },
        transactions: vec![coinbase],
    }
}

fn connect_next(db: &ChainDb) {
    let block = build_block(db);
    db.blocks().put_block(&block).unwrap();
    let journal = db.blocks().build_spend_journal(&block).unwrap();
    db.blocks().connect_block(&block.hash(), journal).unwrap();
}

fn bench_connect_block(c: &mut Criterion) {
    // Fresh store per iteration; only connect_block is timed.
    c.bench_function("connect_block_indexed", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let db = open_db(&dir);
                db.indexes().create_index(IndexKind::TxIndex).unwrap();
                db.indexes().create_index(IndexKind::AddrIndex).unwrap();
                db.indexes().catch_up(&Interrupt::never()).unwrap();
                let block = build_block(&db);
                db.blocks().put_block(&block).unwrap();
                let journal = db.blocks().build_spend_journal(&block).unwrap();
                (dir, db, block.hash(), journal)
            },
            |(_dir, db, hash, journal)| {
                db.blocks().connect_block(black_box(&hash), journal).unwrap();
            },
        )
    });
}

fn bench_reorg_step(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    connect_next(&db);
    let tip = db.blocks().best_tip().unwrap().unwrap();
    let block = db.blocks().fetch_block(&tip.hash).unwrap();

    c.bench_function("disconnect_then_reconnect", |b| {
        b.iter(|| {
            db.blocks().disconnect_tip().unwrap();
            let journal = db.blocks().build_spend_journal(&block).unwrap();
            db.blocks().connect_block(black_box(&tip.hash), journal).unwrap();
        })
    });
}

fn bench_utxo_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    for _ in 0..10 {
        connect_next(&db);
    }

    let existing = OutPoint {
        txid: genesis::genesis_block().transactions[0].txid().unwrap(),
        index: 0,
    };
    let missing = OutPoint {
        txid: Hash256([0xFF; 32]),
        index: 999,
    };

    c.bench_function("utxo_lookup", |b| b.iter(|| db.blocks().utxo(black_box(&existing))));
    c.bench_function("utxo_lookup_miss", |b| b.iter(|| db.blocks().utxo(black_box(&missing))));
}

criterion_group!(benches, bench_connect_block, bench_reorg_step, bench_utxo_lookup);
criterion_main!(benches);
