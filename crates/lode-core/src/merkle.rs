//! Transaction merkle root committed to by block headers.
//!
//! Leaves are `BLAKE3(0x00 || txid)` and inner nodes `BLAKE3(0x01 || left || right)`.
//! A layer of odd length pairs its last hash with itself. No leaves gives
//! [`Hash256::ZERO`].

use crate::types::Hash256;

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

fn tagged(tag: u8, parts: &[&Hash256]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag]);
    for part in parts {
        hasher.update(part.as_bytes());
    }
    Hash256(hasher.finalize().into())
}

pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    let mut layer: Vec<Hash256> = txids.iter().map(|id| tagged(LEAF_TAG, &[id])).collect();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| tagged(NODE_TAG, &[&pair[0], &pair[pair.len() - 1]]))
            .collect();
    }
    layer.first().copied().unwrap_or(Hash256::ZERO)
}
