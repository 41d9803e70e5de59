//! Address index: every transaction that pays to or spends from an address.
//!
//! Key layout is `address(32) || height(BE u64) || offset(BE u32)` with the
//! txid as value, so a prefix scan over an address yields its transactions
//! in chain order. Spends are attributed through the spend journal, which
//! carries the spent output's owner.

use std::collections::BTreeSet;

use lode_core::chain::SpentOutput;
use lode_core::error::{LodeError, StorageError};
use lode_core::types::{Address, Block, Hash256, Transaction};

use super::{IndexKind, Indexer};
use crate::engine::{bucket, ReadTx, UpdateTx};

const KEY_LEN: usize = 32 + 8 + 4;

pub(crate) fn addr_key(address: &Address, height: u64, offset: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[0..32].copy_from_slice(address.as_bytes());
    key[32..40].copy_from_slice(&height.to_be_bytes());
    key[40..44].copy_from_slice(&offset.to_be_bytes());
    key
}

/// Addresses a transaction touches: its outputs' owners and the owners of
/// the outputs it spends.
fn touched(tx: &Transaction, spent: &[SpentOutput]) -> BTreeSet<Address> {
    tx.outputs
        .iter()
        .map(|o| o.pubkey_hash)
        .chain(spent.iter().map(|s| s.entry.output.pubkey_hash))
        .collect()
}

pub(crate) fn txids_for(r: &impl ReadTx, address: &Address) -> Result<Vec<Hash256>, LodeError> {
    r.prefix_scan(bucket::ADDR_INDEX, address.as_ref())?
        .into_iter()
        .map(|(key, value)| -> Result<Hash256, LodeError> {
            Hash256::from_slice(&value).ok_or_else(|| {
                StorageError::Corrupt {
                    bucket: bucket::ADDR_INDEX.to_string(),
                    key: hex::encode(&key),
                    reason: format!("expected 32-byte txid, got {} bytes", value.len()),
                }
                .into()
            })
        })
        .collect()
}

/// Maintains the `addr_index` bucket.
pub struct AddrIndexer;

impl Indexer for AddrIndexer {
    fn kind(&self) -> IndexKind {
        IndexKind::AddrIndex
    }

    fn version(&self) -> u32 {
        1
    }

    fn connect_block(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        _hash: &Hash256,
        height: u64,
        spent: &[&[SpentOutput]],
    ) -> Result<(), LodeError> {
        for (offset, (tx, spent)) in block.transactions.iter().zip(spent).enumerate() {
            let txid = tx.txid()?;
            for address in touched(tx, spent) {
                u.put(bucket::ADDR_INDEX, addr_key(&address, height, offset as u32), txid.0);
            }
        }
        Ok(())
    }

    fn disconnect_block(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        _hash: &Hash256,
        height: u64,
        spent: &[&[SpentOutput]],
    ) -> Result<(), LodeError> {
        for (offset, (tx, spent)) in block.transactions.iter().zip(spent).enumerate() {
            for address in touched(tx, spent) {
                u.delete(bucket::ADDR_INDEX, addr_key(&address, height, offset as u32));
            }
        }
        Ok(())
    }
}
