//! RFC 8785 canonical JSON encoding and hashing.
//!
//! Semantically equal values must always produce equal bytes: object keys
//! sorted by UTF-16 code units, numbers in shortest round-trip form, no
//! insignificant whitespace. `serde_jcs` implements the scheme; this module
//! centralizes its use so every component hashes and signs the exact same
//! byte string for a given value.

use crate::error::CryptoError;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Encodes a value into its canonical RFC 8785 byte representation.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    serde_jcs::to_vec(value).map_err(|e| CryptoError::InvalidCanonicalForm(e.to_string()))
}

/// SHA-256 over the canonical bytes of a value, as 64 lowercase hex chars.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    let bytes = to_canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// SHA-256 over raw bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn canonicalization_is_order_insensitive() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [2, 1]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{  "a": [2, 1], "b": 1}"#).unwrap();

        let ca = to_canonical_bytes(&a).unwrap();
        let cb = to_canonical_bytes(&b).unwrap();
        assert_eq!(ca, cb);

        // JCS implies keys are sorted: {"a":[2,1],"b":1}
        let s = String::from_utf8(ca).unwrap();
        assert!(s.starts_with(r#"{"a""#));
    }

    #[test]
    fn canonicalization_round_trips() {
        // canonicalize(parse(canonicalize(v))) == canonicalize(v)
        let values = [
            json!({"z": {"y": 2, "x": [true, null]}, "a": "é"}),
            json!([1.5, 100, 0.25, "x"]),
            json!({"n": 1e3, "m": 0}),
        ];
        for v in values {
            let once = to_canonical_bytes(&v).unwrap();
            let reparsed: Value = serde_json::from_slice(&once).unwrap();
            let twice = to_canonical_bytes(&reparsed).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let h = canonical_hash_hex(&json!({"k": "v"})).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
