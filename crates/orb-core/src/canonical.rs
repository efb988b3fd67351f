//! Canonical JSON encoding (RFC 8785)
//!
//! Everything that is hashed, signed, or written to content-addressed
//! storage goes through [`canonical_bytes`]: sorted keys, no whitespace,
//! UTF-8. Implementations in other languages MUST produce identical bytes.

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical JSON bytes.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    canonical_string(value).map(String::into_bytes)
}

/// Serialize a value to a canonical JSON string.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String> {
    serde_json_canonicalizer::to_string(value).map_err(|e| Error::Canonicalization(e.to_string()))
}

/// Compare two documents after canonicalization.
///
/// Key order and whitespace differences in the inputs do not affect the
/// result; a canonicalization failure on either side compares unequal.
pub fn canonical_eq<A: Serialize, B: Serialize>(a: &A, b: &B) -> bool {
    match (canonical_bytes(a), canonical_bytes(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_bytes_deterministic() {
        let doc = json!({"b": 1, "a": {"y": true, "x": [3, 2, 1]}});
        let bytes1 = canonical_bytes(&doc).unwrap();
        let bytes2 = canonical_bytes(&doc).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_sorted_keys_no_whitespace() {
        let doc = json!({"b": 1, "a": 2});
        let s = canonical_string(&doc).unwrap();
        assert_eq!(s, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_canonical_eq_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert!(canonical_eq(&a, &b));

        let c = json!({"x": 1, "y": 3});
        assert!(!canonical_eq(&a, &c));
    }
}
