#![forbid(unsafe_code)]
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo
    )
)]

//! # Loom Crypto
//!
//! Canonical JSON encoding (RFC 8785), SHA-256 hashing, and
//! ECDSA/secp256k1 signing for everything the pipeline submits to the
//! metagraph.
//!
//! Two signing modes exist: *regular* signs the hex digest of the canonical
//! bytes directly, while *data-update* wraps the Base64 of the canonical
//! bytes in the data-update protocol prefix before digesting. The caller
//! selects the mode with a boolean at the call site; the prefix never leaks
//! outside this crate.

pub mod canonical;
pub mod error;
pub mod sign;

pub use canonical::{canonical_hash_hex, to_canonical_bytes};
pub use error::CryptoError;
pub use sign::{sign_envelope, verify_signed, KeyPair, SigningMode};
