//! Chain metadata records: chain index entries, the tip, spend journals and
//! transaction locations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Hash256, OutPoint, UtxoEntry};

/// Validation status of a stored block, as reported by the validator.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum BlockStatus {
    /// Stored but not yet judged.
    #[default]
    Unknown,
    /// Fully validated; eligible for the best chain.
    Valid,
    /// Failed validation; never connected.
    Invalid,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStatus::Unknown => "unknown",
            BlockStatus::Valid => "valid",
            BlockStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Per-block metadata. Entries form a tree rooted at genesis.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainIndexEntry {
    /// Distance from genesis.
    pub height: u64,
    /// Sum of header work from genesis up to and including this block.
    pub cumulative_work: u128,
    /// Validation status.
    pub status: BlockStatus,
    /// Parent block id. Zero for genesis.
    pub parent: Hash256,
}

/// The head of the best chain.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u64,
    pub cumulative_work: u128,
}

/// One previous output consumed by a block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SpentOutput {
    /// The output that was spent.
    pub outpoint: OutPoint,
    /// Its unspent-set entry at the time it was spent.
    pub entry: UtxoEntry,
}

/// The outputs a block consumed, in input order across its transactions
/// (coinbase inputs excluded).
///
/// Enough to undo the block's effect on the unspent set without rescanning
/// the chain, and to attribute spends to addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct SpendJournal {
    pub spent: Vec<SpentOutput>,
}

impl SpendJournal {
    pub fn new(spent: Vec<SpentOutput>) -> Self {
        Self { spent }
    }

    pub fn len(&self) -> usize {
        self.spent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }
}

/// Where a transaction lives in the chain.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxLocation {
    /// Containing block.
    pub block_hash: Hash256,
    /// Height of the containing block when it was indexed.
    pub height: u64,
    /// Position of the transaction in the block's transaction list.
    pub offset: u32,
}

/// Result of connecting a block to the best chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectBlockResult {
    /// The new tip.
    pub tip: ChainTip,
    /// Number of new unspent outputs created by this block's transactions.
    pub utxos_created: usize,
    /// Number of outputs spent by this block's non-coinbase inputs.
    pub utxos_spent: usize,
}

/// Result of disconnecting the tip block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectBlockResult {
    /// The block that is no longer on the best chain.
    pub disconnected: Hash256,
    /// The restored tip (the disconnected block's parent).
    pub tip: ChainTip,
    /// Number of previously spent outputs made unspent again.
    pub utxos_restored: usize,
    /// Number of outputs created by the disconnected block and removed.
    pub utxos_removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_unknown() {
        assert_eq!(BlockStatus::default(), BlockStatus::Unknown);
        assert_eq!(BlockStatus::Invalid.to_string(), "invalid");
    }

    #[test]
    fn chain_entry_encodes_large_work() {
        let entry = ChainIndexEntry {
            height: 12,
            cumulative_work: u128::MAX - 5,
            status: BlockStatus::Valid,
            parent: Hash256([9; 32]),
        };
        let bytes = bincode::encode_to_vec(&entry, bincode::config::standard()).unwrap();
        let (decoded, _): (ChainIndexEntry, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn tx_location_serializes_to_json() {
        let loc = TxLocation { block_hash: Hash256([1; 32]), height: 3, offset: 2 };
        let json = serde_json::to_string(&loc).unwrap();
        assert!(json.contains("\"offset\":2"));
    }
}
