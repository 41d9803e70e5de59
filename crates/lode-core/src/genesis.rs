//! Built-in genesis block.
//!
//! The node seeds an empty store with this block so the best chain always
//! has a root. Deterministic: every node computes the identical block.

use std::sync::LazyLock;

use crate::merkle;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Genesis timestamp: January 1, 2026 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: u64 = 1_767_225_600;

/// Message embedded in the genesis coinbase input.
pub const GENESIS_MESSAGE: &[u8] = b"lode genesis: blocks are forever, tips are not";

/// Value of the single genesis output.
pub const GENESIS_REWARD: u64 = 50_0000_0000;

static GENESIS: LazyLock<(Block, Hash256)> = LazyLock::new(|| {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: GENESIS_MESSAGE.to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            value: GENESIS_REWARD,
            pubkey_hash: Hash256(blake3::hash(b"lode genesis output").into()),
        }],
        lock_time: 0,
    };
    // Encoding a fixed in-memory transaction into a Vec cannot fail.
    let coinbase_txid = coinbase
        .txid()
        .expect("genesis coinbase is hardcoded valid data");
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: merkle::merkle_root(&[coinbase_txid]),
            timestamp: GENESIS_TIMESTAMP,
            difficulty_target: u64::MAX,
            nonce: 0,
        },
        transactions: vec![coinbase],
    };
    let hash = block.header.hash();
    (block, hash)
});

/// The genesis block (height 0).
pub fn genesis_block() -> &'static Block {
    &GENESIS.0
}

/// The genesis block id.
pub fn genesis_hash() -> Hash256 {
    GENESIS.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_has_no_parent() {
        assert!(genesis_block().header.is_genesis());
    }

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(genesis_block().hash(), genesis_hash());
        assert_eq!(genesis_hash(), genesis_block().header.hash());
    }

    #[test]
    fn genesis_merkle_root_commits_to_coinbase() {
        let block = genesis_block();
        let txid = block.transactions[0].txid().unwrap();
        assert_eq!(block.header.merkle_root, merkle::merkle_root(&[txid]));
        assert_ne!(block.header.merkle_root, Hash256::ZERO);
        assert!(block.transactions[0].is_coinbase());
    }
}
