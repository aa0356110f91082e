//! Canonical hashing for consensus data.
//!
//! Every hash in the protocol is SHA-256 over a canonical encoding: each
//! argument is rendered as compact JSON with keys sorted, the rendered
//! strings are sorted lexicographically, and the result is their
//! concatenation. This encoding is the binding contract between nodes;
//! any divergence forks the network.
//!
//! Key ordering comes for free: `serde_json::Map` is backed by a `BTreeMap`,
//! so serializing through [`serde_json::Value`] always emits sorted keys.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::TransactionError;

/// Render a value as canonical JSON: compact, keys sorted.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, TransactionError> {
    let v: Value =
        serde_json::to_value(value).map_err(|e| TransactionError::Serialization(e.to_string()))?;
    serde_json::to_string(&v).map_err(|e| TransactionError::Serialization(e.to_string()))
}

/// SHA-256 over the canonical encoding of the given arguments, as lowercase hex.
///
/// Each argument is stringified to canonical JSON, the strings are sorted,
/// and the digest is taken over their concatenation.
pub fn crypto_hash(args: &[Value]) -> String {
    let mut rendered: Vec<String> = args
        .iter()
        .map(|v| serde_json::to_string(v).unwrap_or_default())
        .collect();
    rendered.sort();
    let joined = rendered.concat();
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Number of leading zero bits in the binary expansion of a hex digest.
pub fn leading_zero_bits(hex_digest: &str) -> u32 {
    let mut bits = 0;
    for c in hex_digest.chars() {
        let Some(d) = c.to_digit(16) else { break };
        if d == 0 {
            bits += 4;
        } else {
            bits += d.leading_zeros() - 28;
            break;
        }
    }
    bits
}

/// The proof-of-work predicate: at least `difficulty` leading zero bits.
pub fn satisfies_difficulty(hex_digest: &str, difficulty: u32) -> bool {
    leading_zero_bits(hex_digest) >= difficulty
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- crypto_hash ---

    #[test]
    fn hash_is_64_hex_chars() {
        let h = crypto_hash(&[json!("foo")]);
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_deterministic() {
        let args = [json!(1), json!("two"), json!({"b": 2, "a": 1})];
        assert_eq!(crypto_hash(&args), crypto_hash(&args));
    }

    #[test]
    fn hash_argument_order_is_irrelevant() {
        // Arguments are sorted after stringification.
        let a = crypto_hash(&[json!("foo"), json!("bar")]);
        let b = crypto_hash(&[json!("bar"), json!("foo")]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(crypto_hash(&[json!("foo")]), crypto_hash(&[json!("bar")]));
    }

    #[test]
    fn map_keys_are_sorted() {
        // {"b":.., "a":..} and {"a":.., "b":..} must hash identically.
        let a = crypto_hash(&[json!({"b": 2, "a": 1})]);
        let b = crypto_hash(&[json!({"a": 1, "b": 2})]);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_string_hash_matches_sha256_of_quoted_empty() {
        // crypto_hash serializes the argument, so "" hashes as the two
        // characters `""`.
        use sha2::{Digest, Sha256};
        let expected = hex::encode(Sha256::digest(b"\"\""));
        assert_eq!(crypto_hash(&[json!("")]), expected);
    }

    #[test]
    fn canonical_json_compact_and_sorted() {
        #[derive(serde::Serialize)]
        struct S {
            z: u32,
            a: u32,
        }
        let s = canonical_json(&S { z: 1, a: 2 }).unwrap();
        assert_eq!(s, r#"{"a":2,"z":1}"#);
    }

    // --- leading_zero_bits ---

    #[test]
    fn all_zero_digest() {
        assert_eq!(leading_zero_bits(&"0".repeat(64)), 256);
    }

    #[test]
    fn no_leading_zeros() {
        assert_eq!(leading_zero_bits("ffab"), 0);
    }

    #[test]
    fn partial_nibble_zeros() {
        // '1' = 0001 -> 3 leading zero bits
        assert_eq!(leading_zero_bits("1f"), 3);
        // '0' then '8' (1000) -> 4 bits
        assert_eq!(leading_zero_bits("08"), 4);
        // '0' then '1' -> 7 bits
        assert_eq!(leading_zero_bits("01ff"), 7);
    }

    #[test]
    fn difficulty_predicate() {
        assert!(satisfies_difficulty("01ff", 7));
        assert!(satisfies_difficulty("01ff", 3));
        assert!(!satisfies_difficulty("01ff", 8));
        assert!(satisfies_difficulty("ffff", 0));
    }
}
