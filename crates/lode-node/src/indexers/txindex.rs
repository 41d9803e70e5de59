//! Transaction index: txid -> [`TxLocation`].

use lode_core::chain::{SpentOutput, TxLocation};
use lode_core::error::LodeError;
use lode_core::types::{Block, Hash256};

use super::{IndexKind, Indexer};
use crate::engine::{bucket, UpdateTx};

/// Maintains the `tx_index` bucket.
pub struct TxIndexer;

impl Indexer for TxIndexer {
    fn kind(&self) -> IndexKind {
        IndexKind::TxIndex
    }

    fn version(&self) -> u32 {
        1
    }

    fn connect_block(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        hash: &Hash256,
        height: u64,
        _spent: &[&[SpentOutput]],
    ) -> Result<(), LodeError> {
        for (offset, tx) in block.transactions.iter().enumerate() {
            let location = TxLocation {
                block_hash: *hash,
                height,
                offset: offset as u32,
            };
            u.put_encoded(bucket::TX_INDEX, tx.txid()?.0, &location)?;
        }
        Ok(())
    }

    fn disconnect_block(
        &self,
        u: &mut UpdateTx<'_>,
        block: &Block,
        _hash: &Hash256,
        _height: u64,
        _spent: &[&[SpentOutput]],
    ) -> Result<(), LodeError> {
        for tx in &block.transactions {
            u.delete(bucket::TX_INDEX, tx.txid()?.0);
        }
        Ok(())
    }
}
