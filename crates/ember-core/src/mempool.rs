//! Pool of validated, unconfirmed transactions.
//!
//! Keyed by transaction id. An incoming transaction with a known id replaces
//! the stored entry only when its input timestamp is strictly newer;
//! re-submitting the same entry is a no-op. Ordering for block templates is
//! by fee rate (fee over size), highest first.

use std::collections::BTreeMap;

use tracing::debug;

use crate::block::Block;
use crate::error::TransactionError;
use crate::transaction::Transaction;

/// What [`Mempool::set`] did with the submitted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    /// New id, inserted.
    Inserted,
    /// Known id, replaced by a strictly newer timestamp.
    Replaced,
    /// Known id, incoming entry was not newer; kept the stored one.
    Kept,
}

/// Sum of an address's unconfirmed outgoing value: for every pool
/// transaction it sent, the outputs paid to others plus the fee.
pub fn pending_spends_in(pool: &BTreeMap<String, Transaction>, address: &str) -> u64 {
    pool.values()
        .filter(|tx| tx.input.address() == address)
        .map(|tx| {
            let to_others: u64 = tx
                .output
                .iter()
                .filter(|(addr, _)| addr.as_str() != address)
                .map(|(_, value)| value)
                .sum();
            to_others + tx.fee
        })
        .sum()
}

/// The mempool: unconfirmed transactions by id.
#[derive(Default)]
pub struct Mempool {
    transactions: BTreeMap<String, Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a transaction after static validation.
    ///
    /// Replacement requires a strictly newer input timestamp; equal or older
    /// entries leave the pool unchanged.
    pub fn set(&mut self, tx: Transaction) -> Result<SetOutcome, TransactionError> {
        tx.validate()?;
        match self.transactions.get(&tx.id) {
            Some(existing) => {
                if tx.input.timestamp() > existing.input.timestamp() {
                    debug!(tx_id = %tx.id, "mempool: replaced by newer timestamp");
                    self.transactions.insert(tx.id.clone(), tx);
                    Ok(SetOutcome::Replaced)
                } else {
                    Ok(SetOutcome::Kept)
                }
            }
            None => {
                self.transactions.insert(tx.id.clone(), tx);
                Ok(SetOutcome::Inserted)
            }
        }
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.transactions.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &str) -> Option<&Transaction> {
        self.transactions.get(tx_id)
    }

    pub fn remove(&mut self, tx_id: &str) -> Option<Transaction> {
        self.transactions.remove(tx_id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// The underlying id-to-transaction map, for contextual validation.
    pub fn transactions(&self) -> &BTreeMap<String, Transaction> {
        &self.transactions
    }

    /// All transactions ordered by fee rate, highest first.
    pub fn priority_transactions(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self.transactions.values().cloned().collect();
        // Compare fee/size without division: a.fee * b.size vs b.fee * a.size.
        txs.sort_by(|a, b| {
            let lhs = b.fee as u128 * a.size.max(1) as u128;
            let rhs = a.fee as u128 * b.size.max(1) as u128;
            lhs.cmp(&rhs).then_with(|| a.id.cmp(&b.id))
        });
        txs
    }

    /// Drop every transaction that appears in any block of `chain`.
    pub fn clear_chain_transactions(&mut self, chain: &[Block]) {
        let before = self.transactions.len();
        for block in chain {
            for tx in &block.data {
                self.transactions.remove(&tx.id);
            }
        }
        let removed = before - self.transactions.len();
        if removed > 0 {
            debug!(removed, "mempool: cleared chain-confirmed transactions");
        }
    }

    /// Unconfirmed outgoing value for an address. See [`pending_spends_in`].
    pub fn pending_spends(&self, address: &str) -> u64 {
        pending_spends_in(&self.transactions, address)
    }
}
