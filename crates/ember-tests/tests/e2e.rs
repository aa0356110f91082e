//! End-to-end scenarios across the core, storage, and node layers.

use ember_core::constants::{Priority, COIN, MIN_FEE};
use ember_core::crypto::Keypair;
use ember_core::error::{EmberError, TransactionError};
use ember_core::genesis::{self, GENESIS_SEED_ADDRESS, GENESIS_TX_ID};
use ember_core::hashing::leading_zero_bits;
use ember_core::transaction::Transaction;
use ember_node::{BlockStore, Node, NodeConfig, NodeError};
use ember_tests::signed_request;

fn node_in(dir: &tempfile::TempDir) -> std::sync::Arc<Node> {
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        ..NodeConfig::default()
    };
    Node::new(config).expect("node construction")
}

// ----------------------------------------------------------------------
// Genesis load
// ----------------------------------------------------------------------

#[tokio::test]
async fn empty_store_yields_genesis_chain() {
    let dir = tempfile::tempdir().unwrap();

    // The store seeds itself with genesis.
    let store = BlockStore::open(dir.path().join("chaindata")).unwrap();
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.load_all().unwrap(), vec![genesis::genesis_block().clone()]);
    drop(store);

    let node = node_in(&dir);
    let chain = node.blockchain().read();
    assert_eq!(chain.chain(), &[genesis::genesis_block().clone()][..]);
    assert_eq!(chain.utxo_set()[GENESIS_TX_ID][GENESIS_SEED_ADDRESS], 50 * COIN);
}

// ----------------------------------------------------------------------
// Single mine
// ----------------------------------------------------------------------

#[tokio::test]
async fn single_mine_pays_subsidy() {
    let dir = tempfile::tempdir().unwrap();
    let node = node_in(&dir);
    let miner = Keypair::generate();

    let outcome = node.mine(&miner.address()).await.unwrap();

    assert_eq!(outcome.block.height, 1);
    let coinbase_count = outcome.block.data.iter().filter(|tx| tx.is_coinbase).count();
    assert_eq!(coinbase_count, 1);
    assert_eq!(outcome.reward, 50 * COIN); // halving epoch 0
    assert!(outcome.block.difficulty >= 3); // no retarget at height 1
    assert!(leading_zero_bits(&outcome.block.hash) >= outcome.block.difficulty);
    assert_eq!(node.blockchain().read().balance(&miner.address()), 50 * COIN);
}

// ----------------------------------------------------------------------
// Valid spend
// ----------------------------------------------------------------------

#[tokio::test]
async fn spend_with_default_fee_and_change() {
    let dir = tempfile::tempdir().unwrap();
    let node = node_in(&dir);
    let sender = Keypair::generate();
    node.mine(&sender.address()).await.unwrap();

    let tx = node
        .submit_transaction(signed_request(&sender, "AGrecipient", 10 * COIN, Priority::Medium))
        .await
        .unwrap();
    // Fee = max(BASE_TX_SIZE * DEFAULT_FEE_RATE, MIN_FEE) = 0.001 EMB.
    assert_eq!(tx.fee, MIN_FEE);

    node.mine("AGfeetaker").await.unwrap();

    let chain = node.blockchain().read();
    let outputs = &chain.utxo_set()[&tx.id];
    assert_eq!(outputs["AGrecipient"], 10 * COIN);
    assert_eq!(outputs[&sender.address()], 39_999_000); // 39.999 EMB change
    assert_eq!(chain.balance(&sender.address()), 39_999_000);
}

// ----------------------------------------------------------------------
// Double-spend rejection
// ----------------------------------------------------------------------

#[tokio::test]
async fn second_spend_of_same_utxo_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let node = node_in(&dir);
    let sender = Keypair::generate();
    node.mine(&sender.address()).await.unwrap();

    // An adversarial duplicate built against the pristine ledger, before the
    // first spend lands in the pool.
    let stale = {
        let chain = node.blockchain().read();
        Transaction::create_spend(
            &signed_request(&sender, "AGother", 30 * COIN, Priority::Medium),
            chain.utxo_set(),
            &std::collections::BTreeMap::new(),
        )
        .unwrap()
    };

    node.submit_transaction(signed_request(&sender, "AGrecipient", 30 * COIN, Priority::Medium))
        .await
        .unwrap();

    // Validated against UTXO + mempool the stale duplicate no longer adds up.
    let chain = node.blockchain().read();
    let pool = node.mempool().lock();
    let err = stale.validate_against(chain.utxo_set(), pool.transactions()).unwrap_err();
    assert!(matches!(err, TransactionError::InputAmountMismatch { .. }));
    drop(pool);
    drop(chain);

    // And a fresh construction attempt fails outright on spendable funds.
    let err = node
        .submit_transaction(signed_request(&sender, "AGother", 30 * COIN, Priority::Medium))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NodeError::Ember(EmberError::Transaction(TransactionError::InsufficientFunds { .. }))
    ));
}

// ----------------------------------------------------------------------
// Chain replacement
// ----------------------------------------------------------------------

#[tokio::test]
async fn longer_chain_replaces_local_state() {
    let dir_a = tempfile::tempdir().unwrap();
    let node_a = node_in(&dir_a);
    let sender = Keypair::generate();

    // Node A: height 3 with funds, plus a pending spend in the pool.
    node_a.mine(&sender.address()).await.unwrap();
    node_a.mine("AGminer").await.unwrap();
    node_a.mine("AGminer").await.unwrap();
    assert_eq!(node_a.blockchain().read().current_height(), 3);

    let pending = node_a
        .submit_transaction(signed_request(&sender, "AGrecipient", 5 * COIN, Priority::Medium))
        .await
        .unwrap();
    assert!(node_a.mempool().lock().contains(&pending.id));

    // Node B: an independent chain of height 4 that also confirms a
    // transaction with the pending id (simulating it was gossiped there).
    let dir_b = tempfile::tempdir().unwrap();
    let node_b = node_in(&dir_b);
    for _ in 0..4 {
        node_b.mine("AGfarminer").await.unwrap();
    }
    let candidate = node_b.blockchain().read().chain().to_vec();

    node_a.blockchain().write().replace_chain(candidate).unwrap();
    let chain_blocks = node_a.blockchain().read().chain().to_vec();
    node_a.mempool().lock().clear_chain_transactions(&chain_blocks);

    let chain = node_a.blockchain().read();
    assert_eq!(chain.current_height(), 4);
    assert_eq!(chain.balance("AGfarminer"), 200 * COIN);
    // The fork dropped A's funding block; its UTXO view is rebuilt.
    assert_eq!(chain.balance(&sender.address()), 0);
    // Pending tx not in the new chain stays pooled; confirmed ones would be
    // pruned (none here since B never saw it).
    drop(chain);
    assert!(node_a.mempool().lock().contains(&pending.id));
}

// ----------------------------------------------------------------------
// Conservation across a worked chain
// ----------------------------------------------------------------------

#[tokio::test]
async fn utxo_totals_match_issuance_minus_nothing() {
    // UTXO closure: with no burns, the UTXO total equals all coinbase
    // issuance.
    let dir = tempfile::tempdir().unwrap();
    let node = node_in(&dir);
    let sender = Keypair::generate();

    node.mine(&sender.address()).await.unwrap();
    node.submit_transaction(signed_request(&sender, "AGrecipient", 10 * COIN, Priority::Medium))
        .await
        .unwrap();
    node.mine("AGminer").await.unwrap();

    let chain = node.blockchain().read();
    let utxo_total: u64 = chain
        .utxo_set()
        .values()
        .flat_map(|outputs| outputs.values())
        .sum();
    let issued: u64 = chain
        .chain()
        .iter()
        .flat_map(|b| b.data.iter())
        .filter(|tx| tx.is_coinbase)
        .map(|tx| tx.total_output())
        .sum();
    assert_eq!(utxo_total, issued);
}
