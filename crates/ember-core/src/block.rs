//! Block model, proof-of-work mining, and header validation.
//!
//! The block hash commits to every header field plus the full transaction
//! list via [`crypto_hash`]. Mining increments the nonce, refreshes the
//! timestamp (and with it the difficulty proposal), and recomputes the hash
//! until the leading-zero-bits predicate holds.
//!
//! [`Block::is_valid_block`] performs the header-level checks of a
//! parent/child pair; the UTXO walk across the transaction list lives in
//! [`crate::blockchain`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::BLOCK_SIZE_LIMIT;
use crate::difficulty::{adjust_difficulty, within_window};
use crate::error::{BlockError, TransactionError};
use crate::hashing::{canonical_json, crypto_hash, satisfies_difficulty};
use crate::merkle::merkle_root;
use crate::now_nanos;
use crate::transaction::{block_subsidy, Transaction, TxInput};

/// Current block format version.
pub const BLOCK_VERSION: u32 = 1;

/// A block: hashed header fields plus the ordered transaction list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Creation time in nanoseconds since epoch.
    pub timestamp: u64,
    /// Hash of the parent block.
    pub last_hash: String,
    /// SHA-256 hex digest over the canonical header encoding.
    pub hash: String,
    /// Ordered transactions; coinbase first on mined blocks.
    pub data: Vec<Transaction>,
    /// Required leading zero bits, at least 1.
    pub difficulty: u32,
    pub nonce: u64,
    pub height: u64,
    pub version: u32,
    pub merkle_root: String,
    /// Always equals `data.len()`.
    pub tx_count: u64,
}

impl Block {
    /// Compute the canonical hash over the given header fields.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_hash(
        timestamp: u64,
        last_hash: &str,
        data: &[Transaction],
        difficulty: u32,
        nonce: u64,
        height: u64,
        version: u32,
        merkle_root: &str,
        tx_count: u64,
    ) -> Result<String, TransactionError> {
        let data_value: Value =
            serde_json::to_value(data).map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(crypto_hash(&[
            json!(timestamp),
            json!(last_hash),
            data_value,
            json!(difficulty),
            json!(nonce),
            json!(height),
            json!(version),
            json!(merkle_root),
            json!(tx_count),
        ]))
    }

    /// Recompute this block's hash from its own fields.
    pub fn recompute_hash(&self) -> Result<String, TransactionError> {
        Self::compute_hash(
            self.timestamp,
            &self.last_hash,
            &self.data,
            self.difficulty,
            self.nonce,
            self.height,
            self.version,
            &self.merkle_root,
            self.tx_count,
        )
    }

    /// Serialized size of the transaction list in bytes.
    pub fn data_size(data: &[Transaction]) -> Result<usize, TransactionError> {
        Ok(canonical_json(&data)?.len())
    }

    /// Mine the next block on top of `last_block` with the given
    /// transaction list (coinbase already first).
    ///
    /// Loops nonce, timestamp, difficulty and hash until the proof-of-work
    /// predicate holds at the declared difficulty.
    pub fn mine(last_block: &Block, data: Vec<Transaction>) -> Result<Block, BlockError> {
        let size = Self::data_size(&data)
            .map_err(|e| BlockError::Transaction { index: 0, source: e })?;
        if size > BLOCK_SIZE_LIMIT {
            return Err(BlockError::OversizedBlock { size, max: BLOCK_SIZE_LIMIT });
        }

        let height = last_block.height + 1;
        let last_hash = last_block.hash.clone();
        let root = merkle_root(&data)
            .map_err(|e| BlockError::Transaction { index: 0, source: e })?;
        let tx_count = data.len() as u64;

        let mut nonce: u64 = 0;
        // Keep the timestamp strictly after the parent even on coarse clocks.
        let mut timestamp = now_nanos().max(last_block.timestamp + 1);
        let mut difficulty =
            adjust_difficulty(last_block.difficulty, last_block.timestamp, height, timestamp);
        let mut hash = Self::compute_hash(
            timestamp, &last_hash, &data, difficulty, nonce, height, BLOCK_VERSION, &root, tx_count,
        )
        .map_err(|e| BlockError::Transaction { index: 0, source: e })?;

        while !satisfies_difficulty(&hash, difficulty) {
            nonce += 1;
            timestamp = now_nanos().max(last_block.timestamp + 1);
            difficulty =
                adjust_difficulty(last_block.difficulty, last_block.timestamp, height, timestamp);
            hash = Self::compute_hash(
                timestamp, &last_hash, &data, difficulty, nonce, height, BLOCK_VERSION, &root,
                tx_count,
            )
            .map_err(|e| BlockError::Transaction { index: 0, source: e })?;
        }

        Ok(Block {
            timestamp,
            last_hash,
            hash,
            data,
            difficulty,
            nonce,
            height,
            version: BLOCK_VERSION,
            merkle_root: root,
            tx_count,
        })
    }

    /// Sum of fees over non-coinbase transactions.
    pub fn total_fees(&self) -> u64 {
        self.data
            .iter()
            .filter(|tx| !tx.is_coinbase)
            .map(|tx| tx.fee)
            .sum()
    }

    /// The coinbase transaction, if present.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.data.iter().find(|tx| tx.is_coinbase)
    }

    /// Validate a block against its parent: linkage, proof-of-work,
    /// difficulty window, timestamps, height, merkle root, size, hash
    /// reconstruction, and coinbase accounting. `now_ns` is the receiver's
    /// clock for the future-timestamp check.
    pub fn is_valid_block(last_block: &Block, block: &Block, now_ns: u64) -> Result<(), BlockError> {
        if block.last_hash != last_block.hash {
            return Err(BlockError::LastHashMismatch);
        }
        if !satisfies_difficulty(&block.hash, block.difficulty) {
            return Err(BlockError::InvalidPoW);
        }
        if !within_window(last_block.difficulty, block.difficulty) {
            return Err(BlockError::DifficultyOutOfWindow {
                got: block.difficulty,
                min: last_block.difficulty / 2,
                max: last_block.difficulty * 2,
            });
        }
        if block.timestamp <= last_block.timestamp {
            return Err(BlockError::TimestampNotAfterParent);
        }
        if block.timestamp > now_ns {
            return Err(BlockError::TimestampInFuture);
        }
        if block.height != last_block.height + 1 {
            return Err(BlockError::HeightMismatch {
                got: block.height,
                expected: last_block.height + 1,
            });
        }
        if block.tx_count != block.data.len() as u64 {
            return Err(BlockError::TxCountMismatch {
                got: block.tx_count,
                expected: block.data.len() as u64,
            });
        }

        let root = merkle_root(&block.data)
            .map_err(|e| BlockError::Transaction { index: 0, source: e })?;
        if block.merkle_root != root {
            return Err(BlockError::MerkleRootMismatch {
                expected: root,
                got: block.merkle_root.clone(),
            });
        }

        let size = Self::data_size(&block.data)
            .map_err(|e| BlockError::Transaction { index: 0, source: e })?;
        if size > BLOCK_SIZE_LIMIT {
            return Err(BlockError::OversizedBlock { size, max: BLOCK_SIZE_LIMIT });
        }

        let reconstructed = block
            .recompute_hash()
            .map_err(|e| BlockError::Transaction { index: 0, source: e })?;
        if reconstructed != block.hash {
            return Err(BlockError::HashMismatch);
        }

        Self::check_transactions(block)
    }

    /// Static transaction checks: every tx individually valid, at most one
    /// coinbase (present when height > 0), and the coinbase reward bounded
    /// by subsidy plus collected fees.
    fn check_transactions(block: &Block) -> Result<(), BlockError> {
        let mut coinbase: Option<&Transaction> = None;
        let mut total_fees: u64 = 0;

        for (index, tx) in block.data.iter().enumerate() {
            tx.validate()
                .map_err(|source| BlockError::Transaction { index, source })?;
            if tx.is_coinbase {
                if coinbase.is_some() {
                    return Err(BlockError::MultipleCoinbase);
                }
                coinbase = Some(tx);
            } else {
                total_fees += tx.fee;
            }
        }

        match coinbase {
            Some(tx) => {
                let subsidy = match &tx.input {
                    TxInput::Coinbase(input) => block_subsidy(input.block_height),
                    TxInput::Spend(_) => unreachable!("is_coinbase implies coinbase input"),
                };
                let reward = tx.total_output();
                if reward > subsidy + total_fees {
                    return Err(BlockError::ExcessiveCoinbase {
                        got: reward,
                        subsidy,
                        fees: total_fees,
                    });
                }
            }
            None if block.height > 0 => return Err(BlockError::MissingCoinbase),
            None => {}
        }
        Ok(())
    }
}
