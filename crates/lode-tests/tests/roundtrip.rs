//! Property: connecting a run of blocks and disconnecting them again walks
//! the store back through exactly the states it passed, byte for byte, with
//! both indexes enabled.

use lode_core::genesis;
use lode_core::traits::ChainStore;
use lode_node_lib::indexers::IndexKind;
use lode_node_lib::Interrupt;
use lode_tests::helpers::*;
use proptest::prelude::*;
use proptest::sample::Index;

/// One block: the outputs its spending transaction consumes, and whether a
/// second transaction spends that transaction's change in the same block.
#[derive(Debug, Clone)]
struct BlockPlan {
    inputs: Vec<Index>,
    chained: bool,
}

fn block_plan() -> impl Strategy<Value = BlockPlan> {
    (prop::collection::vec(any::<Index>(), 0..3), any::<bool>())
        .prop_map(|(inputs, chained)| BlockPlan { inputs, chained })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn connect_disconnect_restores_every_state(plans in prop::collection::vec(block_plan(), 1..6)) {
        let (db, _dir) = genesis_db();
        db.indexes().create_index(IndexKind::TxIndex).unwrap();
        db.indexes().create_index(IndexKind::AddrIndex).unwrap();
        db.indexes().catch_up(&Interrupt::never()).unwrap();

        let mut spendable = vec![outpoint(&genesis::genesis_block().transactions[0], 0)];
        let mut states = Vec::new();

        for (i, plan) in plans.iter().enumerate() {
            let height = i as u64 + 1;
            let mut txs = Vec::new();
            let mut inputs = Vec::new();
            for index in &plan.inputs {
                if spendable.is_empty() {
                    break;
                }
                let at = index.index(spendable.len());
                inputs.push(spendable.swap_remove(at));
            }
            if !inputs.is_empty() {
                let owner = pkh(0x40 + height as u8);
                let spend = make_tx(inputs, vec![(1, owner), (1, pkh(0x80 + height as u8))]);
                if plan.chained {
                    txs.push(make_tx(vec![outpoint(&spend, 1)], vec![(1, owner)]));
                    spendable.push(outpoint(&spend, 0));
                } else {
                    spendable.push(outpoint(&spend, 0));
                    spendable.push(outpoint(&spend, 1));
                }
                txs.insert(0, spend);
            }
            for tx in txs.iter().skip(1) {
                spendable.push(outpoint(tx, 0));
            }

            let tip = db.best_tip().unwrap().unwrap();
            let block = store_child(&db, tip.hash, height, EASY, pkh(height as u8), txs);
            spendable.push(outpoint(&block.transactions[0], 0));

            states.push(db.engine().dump().unwrap());
            connect(&db, &block);
        }

        while let Some(expected) = states.pop() {
            db.disconnect_tip().unwrap();
            prop_assert_eq!(db.engine().dump().unwrap(), expected);
        }
        prop_assert_eq!(db.best_tip().unwrap().unwrap().hash, genesis::genesis_hash());
    }
}
