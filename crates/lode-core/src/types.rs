//! Core chain types: hashes, transactions, blocks, unspent outputs.
//!
//! Values are opaque to the store; it only needs stable identities
//! (block header hash, txid) and the output owner (`pubkey_hash`) that the
//! address index is keyed on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::StorageError;

/// 32 opaque bytes: block ids, txids, merkle roots and addresses.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. A block whose `prev_hash` is zero is a genesis block.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build from a 32-byte slice, as read back from a storage key or value.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An address is the hash of the public key an output pays to.
pub type Address = Hash256;

/// Names one output of an earlier transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Hash256,
    /// Position in that transaction's outputs.
    pub index: u64,
}

impl OutPoint {
    /// What a coinbase input points at.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u64::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u64::MAX
    }

    /// Fixed-width storage key: `txid || index(BE)`.
    pub fn to_key(&self) -> [u8; 40] {
        let mut key = [0u8; 40];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Spends the output named by `previous_output`.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    pub previous_output: OutPoint,
    /// Unlocking data; never interpreted here.
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Value locked to an address.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub value: u64,
    /// Owner; the address index keys on this.
    pub pubkey_hash: Address,
}

/// A transaction: consumed outputs in, new outputs out.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u64,
}

impl Transaction {
    /// BLAKE3 over the standard bincode encoding.
    pub fn txid(&self) -> Result<Hash256, StorageError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Exactly one input, spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Number of inputs that spend a real previous output.
    pub fn spending_input_count(&self) -> usize {
        if self.is_coinbase() { 0 } else { self.inputs.len() }
    }
}

/// Fixed-size block header. Its double SHA-256 is the block id.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u64,
    /// Parent block id; zero for genesis.
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    /// Lower target, more work.
    pub difficulty_target: u64,
    pub nonce: u64,
}

impl BlockHeader {
    const HASH_SIZE: usize = 4 * 8 + 2 * 32;

    /// Double SHA-256 over `version || prev_hash || merkle_root || timestamp ||
    /// difficulty_target || nonce`, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty_target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// Expected work represented by this header: `2^64 / (target + 1)`.
    pub fn work(&self) -> u128 {
        (1u128 << 64) / (self.difficulty_target as u128 + 1)
    }

    /// Whether this header starts a chain.
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }
}

/// Header plus transactions, coinbase first.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// First transaction, if any.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Journal length a connect of this block expects.
    pub fn spending_input_count(&self) -> usize {
        self.transactions.iter().map(Transaction::spending_input_count).sum()
    }
}

/// An unspent output plus where it was created.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UtxoEntry {
    pub output: TxOutput,
    pub block_height: u64,
    pub is_coinbase: bool,
}
