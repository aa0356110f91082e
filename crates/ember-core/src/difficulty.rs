//! Difficulty retargeting.
//!
//! The difficulty is the number of leading zero bits the block hash must
//! carry. Retargeting fires only on heights that are multiples of
//! [`DIFFICULTY_INTERVAL`](crate::constants::DIFFICULTY_INTERVAL): the
//! elapsed time over the interval is compared against
//! `TARGET_BLOCK_TIME * DIFFICULTY_INTERVAL`, the proposed difficulty is
//! `old * expected / actual`, changes inside a 5% deadband are ignored, and
//! the result is clamped to `[max(1, old/2), old*2]`.
//!
//! Validation accepts any difficulty inside the `[prev/2, prev*2]` window;
//! the retarget computation itself is not re-run on received blocks because
//! miners refresh their timestamp (and with it the proposal) every nonce.

use crate::constants::{
    BPS, DIFFICULTY_DEADBAND_BPS, DIFFICULTY_INTERVAL, NANOS_PER_SEC, TARGET_BLOCK_TIME_SECS,
};

/// Expected nanoseconds for one full retarget interval.
const EXPECTED_INTERVAL_NANOS: u128 =
    (TARGET_BLOCK_TIME_SECS * DIFFICULTY_INTERVAL * NANOS_PER_SEC) as u128;

/// Compute the difficulty for a block at `height` with timestamp
/// `timestamp_ns`, given the previous block's difficulty and timestamp.
pub fn adjust_difficulty(
    last_difficulty: u32,
    last_timestamp_ns: u64,
    height: u64,
    timestamp_ns: u64,
) -> u32 {
    let last = last_difficulty.max(1);

    if height % DIFFICULTY_INTERVAL != 0 {
        return last;
    }

    // Floor the elapsed time at one second to avoid division blow-ups.
    let actual = (timestamp_ns.saturating_sub(last_timestamp_ns) as u128).max(NANOS_PER_SEC as u128);

    // Ignore changes below the 5% deadband, measured before truncation.
    let scaled = last as u128 * EXPECTED_INTERVAL_NANOS * BPS as u128 / actual;
    let baseline = last as u128 * BPS as u128;
    if scaled.abs_diff(baseline) < last as u128 * DIFFICULTY_DEADBAND_BPS as u128 {
        return last;
    }

    let proposed = (last as u128 * EXPECTED_INTERVAL_NANOS / actual) as u64;
    let min = (last / 2).max(1) as u64;
    let max = last as u64 * 2;
    proposed.clamp(min, max) as u32
}

/// Whether a declared difficulty lies inside the valid `[prev/2, prev*2]`
/// window relative to its parent.
pub fn within_window(prev_difficulty: u32, difficulty: u32) -> bool {
    let prev = prev_difficulty as u64;
    let got = difficulty as u64;
    got >= 1 && got * 2 >= prev && got <= prev * 2
}
