//! Fixed-point monetary amounts.
//!
//! All consensus values are u64 micro-coins (1 EMB = 10^6 micro). Floats
//! never enter hashed or signed content; the signing render below is done
//! entirely in integer arithmetic.

use crate::constants::COIN;
use crate::error::TransactionError;

/// The dust constant added to the amount inside the signed message:
/// 0.00001 EMB = 10 micro.
pub const SIGNING_DUST: u64 = 10;

/// Render a micro-coin value as a decimal coin string with exactly five
/// fraction digits, e.g. `10_000_000` -> `"10.00000"`.
///
/// This is the consensus-critical rendering embedded in signed messages
/// (the source's `f"{amount:.5f}"`). Micro-coins have six decimal places;
/// after adding [`SIGNING_DUST`] the sixth digit is rounded half-up into
/// the fifth, carrying into the whole part when it overflows, so arbitrary
/// client-supplied amounts render the way a `%.5f` format rounds them.
pub fn format_signing_amount(amount_micro: u64) -> String {
    // Value in tenths of a micro-coin, rounded half-up on the dropped digit.
    let tenths = (amount_micro + SIGNING_DUST + 5) / 10;
    let whole = tenths / 100_000;
    let frac5 = tenths % 100_000;
    format!("{whole}.{frac5:05}")
}

/// Render a micro-coin value as a plain decimal coin string with six
/// fraction digits trimmed of trailing zeros (for logs and API output).
pub fn format_coins(amount_micro: u64) -> String {
    let whole = amount_micro / COIN;
    let frac = amount_micro % COIN;
    if frac == 0 {
        return format!("{whole}");
    }
    let s = format!("{whole}.{frac:06}");
    s.trim_end_matches('0').to_string()
}

/// Parse a decimal coin string (up to six fraction digits) into micro-coins.
pub fn parse_coins(s: &str) -> Result<u64, TransactionError> {
    let bad = || TransactionError::InvalidAmount(s.to_string());
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > 6 {
        return Err(bad());
    }
    let whole: u64 = whole.parse().map_err(|_| bad())?;
    let frac_micro = if frac.is_empty() {
        0
    } else {
        let digits: u64 = frac.parse().map_err(|_| bad())?;
        digits * 10u64.pow(6 - frac.len() as u32)
    };
    whole
        .checked_mul(COIN)
        .and_then(|w| w.checked_add(frac_micro))
        .ok_or_else(bad)
}
