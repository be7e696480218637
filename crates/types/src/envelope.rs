//! Signed envelopes attached to every submitted message.

use serde::{Deserialize, Serialize};

/// A single signature over a message's canonical encoding.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct SignatureProof {
    /// Uncompressed secp256k1 public key, hex, without the `04` prefix
    /// (128 hex chars).
    pub id: String,
    /// DER-encoded ECDSA signature, hex, low-S normalized.
    pub signature: String,
}

/// A value paired with one or more signature proofs.
///
/// Submitted transactions must carry a non-empty proof set; the aggregate
/// verifies iff every proof verifies.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Signed<T> {
    /// The signed value.
    pub value: T,
    /// Proofs over the canonical encoding of `value`.
    pub proofs: Vec<SignatureProof>,
}

impl<T> Signed<T> {
    /// Wraps a value with a single proof.
    pub fn single(value: T, proof: SignatureProof) -> Self {
        Self {
            value,
            proofs: vec![proof],
        }
    }
}
