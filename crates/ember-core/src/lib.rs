//! # ember-core
//! Consensus types and validation for the Ember protocol.

pub mod amount;
pub mod block;
pub mod blockchain;
pub mod constants;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod fee_estimator;
pub mod genesis;
pub mod hashing;
pub mod mempool;
pub mod merkle;
pub mod transaction;

/// Nanoseconds since the Unix epoch, the protocol's timestamp unit.
pub fn now_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
