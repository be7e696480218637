//! Local error types for the `loom-crypto` crate.

use loom_types::error::ErrorCode;
use thiserror::Error;

/// Errors produced while canonicalizing, signing, or verifying.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The value could not be reduced to RFC 8785 canonical form.
    #[error("canonicalization failed: {0}")]
    InvalidCanonicalForm(String),
    /// A key could not be parsed from its serialized form.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    /// A signature could not be parsed from its serialized form.
    #[error("malformed signature: {0}")]
    SignatureMalformed(String),
    /// A signature did not verify against the value and public key.
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidCanonicalForm(_) => "CRYPTO_INVALID_CANONICAL_FORM",
            Self::InvalidKey(_) => "CRYPTO_INVALID_KEY",
            Self::SignatureMalformed(_) => "CRYPTO_SIGNATURE_MALFORMED",
            Self::SignatureVerificationFailed(_) => "CRYPTO_SIGNATURE_VERIFICATION_FAILED",
        }
    }
}
