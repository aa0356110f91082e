//! Dynamic fee-rate estimation.
//!
//! The advisory rate reacts to mempool depth and how full recent blocks
//! are. It never drops below [`DEFAULT_FEE_RATE`] and is recomputed at most
//! once per [`FEE_RATE_UPDATE_INTERVAL_SECS`]. Single writer behind a lock;
//! readers get the last computed value.
//!
//! The estimator output is advisory (served by the fee panel); consensus
//! fee rates embedded in transactions are fixed per priority, see
//! [`Priority::fee_rate`](crate::constants::Priority::fee_rate).

use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::block::Block;
use crate::constants::{
    BLOCK_FULLNESS_THRESHOLD_BPS, BLOCK_SIZE_LIMIT, BPS, DEFAULT_FEE_RATE,
    FEE_RATE_UPDATE_INTERVAL_SECS, MEMPOOL_THRESHOLD,
};

/// How many recent blocks feed the fullness signal.
pub const FULLNESS_WINDOW: usize = 10;

struct EstimatorState {
    current_rate: u64,
    last_update: Option<Instant>,
}

/// Fee-rate estimator. Cheap to share behind an `Arc`.
pub struct FeeEstimator {
    state: Mutex<EstimatorState>,
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EstimatorState {
                current_rate: DEFAULT_FEE_RATE,
                last_update: None,
            }),
        }
    }

    /// The last computed rate in milli-micro per byte.
    pub fn current_rate(&self) -> u64 {
        self.state.lock().current_rate
    }

    /// Recompute the rate from the mempool depth and recent block fullness.
    pub fn update(&self, mempool_size: usize, recent_blocks: &[Block]) {
        let fullness = block_fullness_bps(recent_blocks);
        let mut rate = DEFAULT_FEE_RATE as u128;

        // Congested mempool: scale by 1 + (size / threshold) * 0.5.
        let size = mempool_size as u128;
        let threshold = MEMPOOL_THRESHOLD as u128;
        if size > threshold {
            rate = rate * (2 * threshold + size) / (2 * threshold);
        }

        // Full blocks: scale by 1 + (fullness / threshold) * 0.3.
        let fullness = fullness as u128;
        let fullness_threshold = BLOCK_FULLNESS_THRESHOLD_BPS as u128;
        if fullness > fullness_threshold {
            rate = rate * (10 * fullness_threshold + 3 * fullness) / (10 * fullness_threshold);
        }

        let rate = (rate.min(u64::MAX as u128) as u64).max(DEFAULT_FEE_RATE);
        let mut state = self.state.lock();
        state.current_rate = rate;
        state.last_update = Some(Instant::now());
        debug!(rate, mempool_size, fullness = fullness as u64, "fee rate updated");
    }

    /// Recompute only if [`FEE_RATE_UPDATE_INTERVAL_SECS`] elapsed since the
    /// last update.
    pub fn ensure_updated(&self, mempool_size: usize, recent_blocks: &[Block]) {
        let stale = {
            let state = self.state.lock();
            match state.last_update {
                Some(at) => at.elapsed().as_secs() > FEE_RATE_UPDATE_INTERVAL_SECS,
                None => true,
            }
        };
        if stale {
            self.update(mempool_size, recent_blocks);
        }
    }
}

/// Aggregate fullness of recent blocks in basis points of
/// [`BLOCK_SIZE_LIMIT`]: sum of transaction sizes over `count * limit`.
pub fn block_fullness_bps(blocks: &[Block]) -> u64 {
    if blocks.is_empty() {
        return 0;
    }
    let total: u128 = blocks
        .iter()
        .flat_map(|b| b.data.iter())
        .map(|tx| tx.size as u128)
        .sum();
    let capacity = blocks.len() as u128 * BLOCK_SIZE_LIMIT as u128;
    (total * BPS as u128 / capacity) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis;
    use crate::transaction::Transaction;

    /// A block whose transactions claim the given total serialized size.
    fn block_with_size(total_size: u64) -> Block {
        let mut tx = Transaction::coinbase("AGminer", 1, 0).unwrap();
        tx.size = total_size;
        let mut block = genesis::genesis_block().clone();
        block.data = vec![tx];
        block
    }

    // ------------------------------------------------------------------
    // Fullness signal
    // ------------------------------------------------------------------

    #[test]
    fn fullness_of_no_blocks_is_zero() {
        assert_eq!(block_fullness_bps(&[]), 0);
    }

    #[test]
    fn fullness_is_proportional() {
        // One block half full.
        let blocks = [block_with_size(BLOCK_SIZE_LIMIT as u64 / 2)];
        assert_eq!(block_fullness_bps(&blocks), BPS / 2);
    }

    #[test]
    fn fullness_averages_over_blocks() {
        let blocks = [
            block_with_size(BLOCK_SIZE_LIMIT as u64),
            block_with_size(0),
        ];
        assert_eq!(block_fullness_bps(&blocks), BPS / 2);
    }

    // ------------------------------------------------------------------
    // Rate computation
    // ------------------------------------------------------------------

    #[test]
    fn idle_network_keeps_default_rate() {
        let est = FeeEstimator::new();
        est.update(0, &[]);
        assert_eq!(est.current_rate(), DEFAULT_FEE_RATE);
    }

    #[test]
    fn rate_never_below_default() {
        let est = FeeEstimator::new();
        est.update(5, &[block_with_size(100)]);
        assert_eq!(est.current_rate(), DEFAULT_FEE_RATE);
    }

    #[test]
    fn congested_mempool_raises_rate() {
        let est = FeeEstimator::new();
        // size = 2 * threshold -> rate * (1 + 2 * 0.5) = 2x.
        est.update(2 * MEMPOOL_THRESHOLD as usize, &[]);
        assert_eq!(est.current_rate(), 2 * DEFAULT_FEE_RATE);
    }

    #[test]
    fn full_blocks_raise_rate() {
        let est = FeeEstimator::new();
        // Fully packed window: fullness = BPS, threshold 8000 bps.
        // rate * (1 + (10000/8000) * 0.3) = rate * 1.375.
        let blocks: Vec<Block> = (0..3).map(|_| block_with_size(BLOCK_SIZE_LIMIT as u64)).collect();
        est.update(0, &blocks);
        assert_eq!(est.current_rate(), DEFAULT_FEE_RATE * 1375 / 1000);
    }

    #[test]
    fn both_signals_compound() {
        let est = FeeEstimator::new();
        let blocks: Vec<Block> = (0..2).map(|_| block_with_size(BLOCK_SIZE_LIMIT as u64)).collect();
        est.update(2 * MEMPOOL_THRESHOLD as usize, &blocks);
        // 2x from the mempool, then 1.375x from fullness.
        assert_eq!(est.current_rate(), 2 * DEFAULT_FEE_RATE * 1375 / 1000);
    }

    #[test]
    fn ensure_updated_respects_cooldown() {
        let est = FeeEstimator::new();
        // First call computes (no prior update).
        est.ensure_updated(2 * MEMPOOL_THRESHOLD as usize, &[]);
        let raised = est.current_rate();
        assert!(raised > DEFAULT_FEE_RATE);

        // Second call inside the cooldown window is a no-op even though the
        // congestion is gone.
        est.ensure_updated(0, &[]);
        assert_eq!(est.current_rate(), raised);
    }
}
