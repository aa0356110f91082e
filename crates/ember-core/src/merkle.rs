//! Merkle commitment over a block's ordered transaction list.
//!
//! Leaves are SHA-256 digests of each transaction's canonical JSON. Internal
//! levels pair adjacent hashes and hash their concatenation; a lone final
//! hash at any level is promoted unchanged (no duplication). The root of an
//! empty list is the hash of the empty string.

use serde_json::Value;

use crate::error::TransactionError;
use crate::hashing::crypto_hash;
use crate::transaction::Transaction;

/// Compute the Merkle root for an ordered transaction list.
pub fn merkle_root(transactions: &[Transaction]) -> Result<String, TransactionError> {
    if transactions.is_empty() {
        return Ok(crypto_hash(&[Value::String(String::new())]));
    }

    let mut level: Vec<String> = transactions
        .iter()
        .map(|tx| Ok(crypto_hash(&[Value::String(tx.canonical()?)])))
        .collect::<Result<_, TransactionError>>()?;

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut pairs = level.chunks(2);
        for pair in &mut pairs {
            match pair {
                [left, right] => {
                    next.push(crypto_hash(&[Value::String(format!("{left}{right}"))]))
                }
                // Odd element out is promoted to the next level unchanged.
                [lone] => next.push(lone.clone()),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        level = next;
    }

    Ok(level.remove(0))
}
