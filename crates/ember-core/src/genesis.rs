//! Genesis block definition.
//!
//! The genesis block is a fixed constant shared by every node: height 0, a
//! fixed last-hash literal, difficulty 3, and a single initial-funding
//! coinbase minting [`BLOCK_SUBSIDY`] to the seed address. Its hash is
//! canonical over the same fields as mined blocks (it does not need to
//! satisfy proof-of-work; validation starts at height 1).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::block::{Block, BLOCK_VERSION};
use crate::constants::{BASE_TX_SIZE, BLOCK_SUBSIDY, COINBASE_ADDRESS};
use crate::merkle::merkle_root;
use crate::transaction::{CoinbaseInput, Transaction, TxInput};

/// Genesis creation time in nanoseconds since epoch.
pub const GENESIS_TIMESTAMP: u64 = 1_746_707_304_053_502_800;

/// The parent-hash literal of the genesis block.
pub const GENESIS_LAST_HASH: &str =
    "d89f504b7499128eb40c973e0b5a7ec84e54c65449ae5da894b3dec0b3e2858a";

/// Proof-of-work difficulty declared by the genesis block.
pub const GENESIS_DIFFICULTY: u32 = 3;

/// The address funded by the genesis coinbase.
pub const GENESIS_SEED_ADDRESS: &str = "AGb169392f5d2ebc032cf6afc4645159ee2";

/// Transaction id of the initial-funding coinbase.
pub const GENESIS_TX_ID: &str = "genesis_initial_tx";

static GENESIS: LazyLock<Block> = LazyLock::new(build_genesis);

fn build_genesis() -> Block {
    let mut output = BTreeMap::new();
    output.insert(GENESIS_SEED_ADDRESS.to_string(), BLOCK_SUBSIDY);

    let tx = Transaction {
        id: GENESIS_TX_ID.to_string(),
        input: TxInput::Coinbase(CoinbaseInput {
            timestamp: GENESIS_TIMESTAMP,
            address: COINBASE_ADDRESS.to_string(),
            public_key: COINBASE_ADDRESS.to_string(),
            signature: COINBASE_ADDRESS.to_string(),
            coinbase_data: "Initial funding".to_string(),
            block_height: 0,
            subsidy: BLOCK_SUBSIDY,
            fees: 0,
        }),
        output,
        fee: 0,
        size: BASE_TX_SIZE,
        fee_rate: 0,
        is_coinbase: true,
    };

    let data = vec![tx];
    let merkle = merkle_root(&data).expect("genesis transaction is hardcoded valid data");
    let hash = Block::compute_hash(
        GENESIS_TIMESTAMP,
        GENESIS_LAST_HASH,
        &data,
        GENESIS_DIFFICULTY,
        0,
        0,
        BLOCK_VERSION,
        &merkle,
        1,
    )
    .expect("genesis block is hardcoded valid data");

    Block {
        timestamp: GENESIS_TIMESTAMP,
        last_hash: GENESIS_LAST_HASH.to_string(),
        hash,
        data,
        difficulty: GENESIS_DIFFICULTY,
        nonce: 0,
        height: 0,
        version: BLOCK_VERSION,
        merkle_root: merkle,
        tx_count: 1,
    }
}

/// The genesis block (height 0).
pub fn genesis_block() -> &'static Block {
    &GENESIS
}

/// Whether a block equals the genesis constant.
pub fn is_genesis(block: &Block) -> bool {
    *block == *genesis_block()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    #[test]
    fn genesis_deterministic() {
        assert_eq!(genesis_block(), genesis_block());
    }

    #[test]
    fn genesis_shape() {
        let g = genesis_block();
        assert_eq!(g.height, 0);
        assert_eq!(g.difficulty, GENESIS_DIFFICULTY);
        assert_eq!(g.nonce, 0);
        assert_eq!(g.last_hash, GENESIS_LAST_HASH);
        assert_eq!(g.tx_count, 1);
        assert_eq!(g.data.len(), 1);
    }

    #[test]
    fn genesis_funds_seed_address() {
        let g = genesis_block();
        let tx = &g.data[0];
        assert_eq!(tx.id, GENESIS_TX_ID);
        assert!(tx.is_coinbase);
        assert_eq!(tx.output[GENESIS_SEED_ADDRESS], 50 * COIN);
        assert_eq!(tx.total_output(), BLOCK_SUBSIDY);
    }

    #[test]
    fn genesis_coinbase_validates() {
        genesis_block().data[0].validate().unwrap();
    }

    #[test]
    fn genesis_hash_matches_recomputation() {
        let g = genesis_block();
        assert_eq!(g.hash, g.recompute_hash().unwrap());
        assert_eq!(g.merkle_root, merkle_root(&g.data).unwrap());
    }

    #[test]
    fn is_genesis_detects_tampering() {
        assert!(is_genesis(genesis_block()));
        let mut forged = genesis_block().clone();
        forged.nonce = 1;
        assert!(!is_genesis(&forged));
    }
}
