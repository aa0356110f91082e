//! Protocol constants. All monetary values in micro-coins (1 EMB = 10^6 micro).

/// Micro-coins per whole coin.
pub const COIN: u64 = 1_000_000;

/// Initial mined reward per block (50 EMB). Halves every [`HALVING_INTERVAL`].
pub const BLOCK_SUBSIDY: u64 = 50 * COIN;

/// Blocks per subsidy halving.
pub const HALVING_INTERVAL: u64 = 210_000;

/// Maximum serialized size of a block's transaction list in bytes.
pub const BLOCK_SIZE_LIMIT: usize = 1_000_000;

/// Minimum transaction fee (0.001 EMB).
pub const MIN_FEE: u64 = 1_000;

/// Floor size used for fee computation, in bytes.
pub const BASE_TX_SIZE: u64 = 250;

/// Fee rates are expressed in milli-micro-coins per byte for sub-micro
/// precision (4_000 = 4 micro per byte).
pub const FEE_RATE_PRECISION: u64 = 1_000;

/// Default fee rate in milli-micro per byte. At [`BASE_TX_SIZE`] this yields
/// exactly [`MIN_FEE`] for a medium-priority transaction.
pub const DEFAULT_FEE_RATE: u64 = 4_000;

/// Mempool depth above which the fee estimator scales the rate up.
pub const MEMPOOL_THRESHOLD: u64 = 10_000;

/// Block fullness (basis points of [`BLOCK_SIZE_LIMIT`]) above which the fee
/// estimator scales the rate up.
pub const BLOCK_FULLNESS_THRESHOLD_BPS: u64 = 8_000;

/// Basis-point denominator for fullness and priority arithmetic.
pub const BPS: u64 = 10_000;

/// Minimum seconds between fee-rate recomputations.
pub const FEE_RATE_UPDATE_INTERVAL_SECS: u64 = 60;

/// Priority multipliers in basis points: low 0.8x, medium 1.0x, high 1.5x.
pub const PRIORITY_MULTIPLIERS_BPS: [(Priority, u64); 3] = [
    (Priority::Low, 8_000),
    (Priority::Medium, 10_000),
    (Priority::High, 15_000),
];

/// Target seconds per block for difficulty retargeting.
pub const TARGET_BLOCK_TIME_SECS: u64 = 9;

/// Retargeting fires only on heights that are multiples of this interval.
pub const DIFFICULTY_INTERVAL: u64 = 9;

/// Relative difficulty change below this deadband (basis points) is ignored.
pub const DIFFICULTY_DEADBAND_BPS: u64 = 500;

/// Lower bound on mining cadence in seconds, exposed for operators tuning
/// local miners.
pub const MINRATE_SECS: u64 = 30;

/// Initial number of blocks fetched per sync chunk.
pub const CHUNK_SIZE: u64 = 10;

/// Bounds and step for adaptive chunk sizing.
pub const MIN_CHUNK_SIZE: u64 = 5;
pub const MAX_CHUNK_SIZE: u64 = 50;
pub const CHUNK_SIZE_STEP: u64 = 5;

/// Seconds to wait for a chunk (or any correlated response) before giving up.
pub const CHUNK_TIMEOUT_SECS: u64 = 30;

/// The sender address that denotes protocol issuance.
pub const COINBASE_ADDRESS: &str = "coinbase";

/// Reliability failures at or above this count deprioritize a peer.
pub const RELIABILITY_THRESHOLD: u32 = 5;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

use serde::{Deserialize, Serialize};

/// Fee priority selected by the transaction sender.
///
/// Serialized lowercase; the lowercase name is embedded verbatim in the
/// signed message, so the rendering is consensus-critical.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// The lowercase wire/signing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Multiplier in basis points applied to [`DEFAULT_FEE_RATE`].
    pub fn multiplier_bps(&self) -> u64 {
        match self {
            Priority::Low => 8_000,
            Priority::Medium => 10_000,
            Priority::High => 15_000,
        }
    }

    /// The consensus fee rate for this priority, in milli-micro per byte.
    pub fn fee_rate(&self) -> u64 {
        DEFAULT_FEE_RATE * self.multiplier_bps() / BPS
    }

    /// Derive the priority from a transaction's stored fee rate, if it
    /// matches one of the three consensus rates exactly.
    pub fn from_fee_rate(rate: u64) -> Option<Priority> {
        PRIORITY_MULTIPLIERS_BPS
            .iter()
            .find(|(p, _)| p.fee_rate() == rate)
            .map(|(p, _)| *p)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(()),
        }
    }
}
