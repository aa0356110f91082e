//! Chain container and UTXO ledger maintenance.
//!
//! The [`Blockchain`] owns the chain, the UTXO set, and the current height.
//! Mutation happens on exactly two paths — single-block append and whole
//! chain replacement — and both build the new state before committing, so a
//! failure leaves everything untouched (the atomic-swap contract).
//!
//! # UTXO walk semantics
//!
//! Applying a block advances the view transaction by transaction: every
//! listed `prev_tx_id` must be present in the view with an entry owned by
//! the sender, those entries are consumed, and the declared input amount
//! must equal the total consumed. A reference to an id that is absent, or
//! whose sender entry was already spent, aborts the walk. Presence makes
//! double spends impossible; the amount equality makes inflation
//! impossible.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::block::Block;
use crate::constants::{BLOCK_SUBSIDY, HALVING_INTERVAL};
use crate::error::{BlockError, ChainError};
use crate::genesis::genesis_block;
use crate::now_nanos;
use crate::transaction::{Transaction, TxInput};

/// The ledger state: transaction id to its unspent outputs (address to amount).
pub type UtxoSet = BTreeMap<String, BTreeMap<String, u64>>;

/// The blockchain: an ordered chain from genesis plus the derived UTXO set.
pub struct Blockchain {
    chain: Vec<Block>,
    utxo_set: UtxoSet,
    current_height: u64,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// A fresh chain holding only the genesis block.
    pub fn new() -> Self {
        let genesis = genesis_block().clone();
        let mut utxo_set = UtxoSet::new();
        for tx in &genesis.data {
            utxo_set.insert(tx.id.clone(), tx.output.clone());
        }
        Self {
            chain: vec![genesis],
            utxo_set,
            current_height: 0,
        }
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The tip of the chain. The chain is never empty.
    pub fn tip(&self) -> &Block {
        self.chain.last().expect("chain always holds genesis")
    }

    /// The last `n` blocks, oldest first.
    pub fn recent_blocks(&self, n: usize) -> &[Block] {
        let start = self.chain.len().saturating_sub(n);
        &self.chain[start..]
    }

    /// Validate and append a single mined or received block, advancing the
    /// UTXO set. On error the chain and ledger are unchanged.
    pub fn append_block(&mut self, block: Block) -> Result<(), ChainError> {
        Block::is_valid_block(self.tip(), &block, now_nanos())
            .map_err(|source| ChainError::Block { height: block.height, source })?;

        let mut view = self.utxo_set.clone();
        apply_block(&mut view, &block)?;

        self.current_height = block.height;
        self.chain.push(block);
        self.utxo_set = view;
        Ok(())
    }

    /// Replace the chain with a strictly longer, fully valid candidate.
    ///
    /// Validates genesis equality and every parent/child pair, rebuilds the
    /// UTXO set from scratch, and only then swaps in the new state. Any
    /// failure surfaces as [`ChainError`] with the previous state intact.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<(), ChainError> {
        if candidate.is_empty() {
            return Err(ChainError::EmptyChain);
        }
        if candidate.len() <= self.chain.len() {
            return Err(ChainError::NotLonger {
                candidate: candidate.len(),
                current: self.chain.len(),
            });
        }
        if candidate[0] != *genesis_block() {
            return Err(ChainError::GenesisMismatch);
        }

        let now = now_nanos();
        for pair in candidate.windows(2) {
            Block::is_valid_block(&pair[0], &pair[1], now)
                .map_err(|source| ChainError::Block { height: pair[1].height, source })?;
        }

        let utxo_set = rebuild_utxo_set(&candidate)?;

        self.current_height = candidate.len() as u64 - 1;
        self.chain = candidate;
        self.utxo_set = utxo_set;
        debug!(height = self.current_height, "chain replaced");
        Ok(())
    }

    /// Confirmed balance of an address: the sum of its unspent outputs.
    pub fn balance(&self, address: &str) -> u64 {
        self.utxo_set
            .values()
            .filter_map(|outputs| outputs.get(address))
            .sum()
    }

    /// Look up a block by height.
    pub fn block_by_height(&self, height: u64) -> Option<&Block> {
        self.chain.get(height as usize)
    }

    /// Look up a block by hash.
    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.chain.iter().find(|b| b.hash == hash)
    }

    /// Find a confirmed transaction and the height of its block.
    pub fn find_transaction(&self, tx_id: &str) -> Option<(&Transaction, u64)> {
        self.chain.iter().find_map(|block| {
            block
                .data
                .iter()
                .find(|tx| tx.id == tx_id)
                .map(|tx| (tx, block.height))
        })
    }

    /// All confirmed transactions that touch an address, with block heights.
    pub fn transactions_for_address(&self, address: &str) -> Vec<(&Transaction, u64)> {
        self.chain
            .iter()
            .flat_map(|block| {
                block.data.iter().filter_map(move |tx| {
                    let touches = tx.input.address() == address || tx.output.contains_key(address);
                    touches.then_some((tx, block.height))
                })
            })
            .collect()
    }
}

/// Total protocol-issued subsidy over the first `block_count` blocks.
pub fn total_subsidy(block_count: u64) -> u64 {
    let mut total: u64 = 0;
    let halvings = block_count / HALVING_INTERVAL;
    for epoch in 0..=halvings {
        let remaining = block_count - epoch * HALVING_INTERVAL;
        let blocks = remaining.min(HALVING_INTERVAL);
        if blocks == 0 || epoch >= 64 {
            break;
        }
        total = total.saturating_add(blocks.saturating_mul(BLOCK_SUBSIDY >> epoch));
    }
    total
}

/// Advance a UTXO view by one block, validating as it goes.
///
/// Every transaction must pass static validation; every listed `prev_tx_id`
/// must be an unspent entry of the view owned by the sender, and the
/// spend's declared input amount must equal the value actually consumed.
/// A duplicate transaction id overwrites the older entry with a warning.
pub fn apply_block(utxo: &mut UtxoSet, block: &Block) -> Result<(), ChainError> {
    for (index, tx) in block.data.iter().enumerate() {
        tx.validate().map_err(|e| ChainError::Block {
            height: block.height,
            source: BlockError::Transaction { index, source: e },
        })?;

        if let TxInput::Spend(input) = &tx.input {
            let mut consumed: u64 = 0;
            for prev_tx_id in &input.prev_tx_ids {
                let Some(outputs) = utxo.get_mut(prev_tx_id) else {
                    return Err(ChainError::MissingUtxo {
                        utxo: prev_tx_id.clone(),
                        address: input.address.clone(),
                    });
                };
                let Some(value) = outputs.remove(&input.address) else {
                    return Err(ChainError::MissingUtxo {
                        utxo: prev_tx_id.clone(),
                        address: input.address.clone(),
                    });
                };
                consumed += value;
                if outputs.is_empty() {
                    utxo.remove(prev_tx_id);
                }
            }
            if input.amount != consumed {
                return Err(ChainError::RebuildFailed {
                    tx_id: tx.id.clone(),
                    reason: format!(
                        "input amount {} does not match consumed UTXO total {consumed}",
                        input.amount
                    ),
                });
            }
        }

        if utxo.contains_key(&tx.id) {
            warn!(tx_id = %tx.id, "duplicate transaction id during UTXO apply, overwriting");
        }
        utxo.insert(tx.id.clone(), tx.output.clone());
    }
    Ok(())
}

/// Rebuild the UTXO set from scratch over a full chain.
pub fn rebuild_utxo_set(chain: &[Block]) -> Result<UtxoSet, ChainError> {
    let mut utxo = UtxoSet::new();
    for block in chain {
        apply_block(&mut utxo, block)?;
    }
    Ok(utxo)
}
