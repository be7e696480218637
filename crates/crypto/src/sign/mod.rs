//! ECDSA/secp256k1 key pairs, proofs, and envelope verification.

use crate::canonical::{sha256, to_canonical_bytes};
use crate::error::CryptoError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use loom_types::envelope::{SignatureProof, Signed};
use rand::rngs::OsRng;
use serde::Serialize;

/// Protocol prefix applied to data-update messages before digesting.
/// Mirrors the metagraph's signing convention; callers never see it.
const DATA_UPDATE_PREFIX: &str = "\u{19}Constellation Signed Data:\n";

/// How the message digest is derived from a value before ECDSA signing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SigningMode {
    /// SHA-256 over the canonical bytes; the hex digest is the message.
    Regular,
    /// Canonical bytes → Base64 → protocol prefix → SHA-256 hex digest.
    DataUpdate,
}

impl SigningMode {
    /// Resolves the boolean flag used at call sites.
    pub fn from_flag(data_update: bool) -> Self {
        if data_update {
            Self::DataUpdate
        } else {
            Self::Regular
        }
    }
}

/// A secp256k1 key pair with its derived address.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    public_key: [u8; 64],
    address: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret scalar through Debug output.
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .finish()
    }
}

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Restores a key pair from a 32-byte secret scalar in hex.
    pub fn from_private_hex(private_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(private_hex.trim_start_matches("0x"))
            .map_err(|e| CryptoError::InvalidKey(format!("private key hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("private key scalar: {e}")))?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let point = signing_key.verifying_key().to_encoded_point(false);
        let mut public_key = [0u8; 64];
        // Skip the 0x04 uncompressed-point tag.
        public_key.copy_from_slice(&point.as_bytes()[1..65]);
        let address = address_from_public_key(&public_key);
        Self {
            signing_key,
            public_key,
            address,
        }
    }

    /// The derived address for this key pair.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The 64-byte uncompressed public point as hex (no `04` prefix).
    /// This is the `id` carried inside signature proofs.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// The 32-byte secret scalar as hex.
    pub fn private_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Signs a value in the given mode, producing a low-S DER proof.
    pub fn sign_value<T: Serialize>(
        &self,
        value: &T,
        mode: SigningMode,
    ) -> Result<SignatureProof, CryptoError> {
        let message = signing_message(value, mode)?;
        let signature: Signature = self.signing_key.sign(message.as_bytes());
        let signature = signature.normalize_s().unwrap_or(signature);
        Ok(SignatureProof {
            id: self.public_hex(),
            signature: hex::encode(signature.to_der().as_bytes()),
        })
    }
}

/// Derives the fixed address for a 64-byte uncompressed public point:
/// hex of the last 20 bytes of its SHA-256 digest.
pub fn address_from_public_key(public_key: &[u8; 64]) -> String {
    let digest = sha256(public_key);
    hex::encode(&digest[12..])
}

/// Derives the address carried by a proof's `id` field.
pub fn address_from_proof(proof: &SignatureProof) -> Result<String, CryptoError> {
    let bytes = hex::decode(&proof.id)
        .map_err(|e| CryptoError::InvalidKey(format!("proof id hex: {e}")))?;
    let key: [u8; 64] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("proof id must be 64 bytes".to_string()))?;
    Ok(address_from_public_key(&key))
}

/// Signs a value and wraps it into a single-proof envelope.
///
/// `data_update` selects the data-update protocol digest; regular hashing
/// otherwise.
pub fn sign_envelope<T: Serialize>(
    keypair: &KeyPair,
    value: T,
    data_update: bool,
) -> Result<Signed<T>, CryptoError> {
    let proof = keypair.sign_value(&value, SigningMode::from_flag(data_update))?;
    Ok(Signed::single(value, proof))
}

/// Verifies every proof of an envelope over the value's canonical encoding.
///
/// At least one proof must be present. Received high-S signatures are
/// rewritten to low-S (`S' = n − S`) before the check, which does not affect
/// validity semantics.
pub fn verify_signed<T: Serialize>(signed: &Signed<T>, data_update: bool) -> Result<(), CryptoError> {
    if signed.proofs.is_empty() {
        return Err(CryptoError::SignatureVerificationFailed(
            "envelope carries no proofs".to_string(),
        ));
    }
    let message = signing_message(&signed.value, SigningMode::from_flag(data_update))?;
    for proof in &signed.proofs {
        verify_proof(message.as_bytes(), proof)?;
    }
    Ok(())
}

fn verify_proof(message: &[u8], proof: &SignatureProof) -> Result<(), CryptoError> {
    let key_bytes = hex::decode(&proof.id)
        .map_err(|e| CryptoError::InvalidKey(format!("proof id hex: {e}")))?;
    if key_bytes.len() != 64 {
        return Err(CryptoError::InvalidKey(
            "proof id must be a 64-byte uncompressed point".to_string(),
        ));
    }
    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(&key_bytes);
    let verifying_key = VerifyingKey::from_sec1_bytes(&sec1)
        .map_err(|e| CryptoError::InvalidKey(format!("proof public key: {e}")))?;

    let der = hex::decode(&proof.signature)
        .map_err(|e| CryptoError::SignatureMalformed(format!("signature hex: {e}")))?;
    let signature = Signature::from_der(&der)
        .map_err(|e| CryptoError::SignatureMalformed(format!("DER decode: {e}")))?;
    let signature = signature.normalize_s().unwrap_or(signature);

    verifying_key
        .verify(message, &signature)
        .map_err(|e| CryptoError::SignatureVerificationFailed(e.to_string()))
}

/// Builds the exact byte string handed to ECDSA for a value and mode.
fn signing_message<T: Serialize>(value: &T, mode: SigningMode) -> Result<String, CryptoError> {
    let canonical = to_canonical_bytes(value)?;
    match mode {
        SigningMode::Regular => Ok(hex::encode(sha256(&canonical))),
        SigningMode::DataUpdate => {
            let b64 = BASE64.encode(&canonical);
            let prefixed = format!("{DATA_UPDATE_PREFIX}{}\n{}", b64.len(), b64);
            Ok(hex::encode(sha256(prefixed.as_bytes())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::scalar::IsHigh;
    use serde_json::json;

    #[test]
    fn sign_verify_round_trip_both_modes() {
        let kp = KeyPair::generate();
        let value = json!({"fiberId": "f-1", "eventName": "accept", "targetSequenceNumber": 3});

        for data_update in [false, true] {
            let signed = sign_envelope(&kp, value.clone(), data_update).unwrap();
            verify_signed(&signed, data_update).unwrap();
            // Mode mismatch must fail.
            assert!(verify_signed(&signed, !data_update).is_err());
        }
    }

    #[test]
    fn emitted_signatures_are_low_s() {
        let kp = KeyPair::generate();
        for i in 0..16 {
            let proof = kp
                .sign_value(&json!({ "n": i }), SigningMode::Regular)
                .unwrap();
            let der = hex::decode(&proof.signature).unwrap();
            let sig = Signature::from_der(&der).unwrap();
            assert!(!bool::from(sig.s().is_high()), "high-S signature emitted");
        }
    }

    #[test]
    fn high_s_rewrite_is_accepted_on_verify() {
        let kp = KeyPair::generate();
        let value = json!({"k": "v"});
        let signed = sign_envelope(&kp, value.clone(), false).unwrap();

        // Flip the emitted low-S signature to its high-S twin.
        let der = hex::decode(&signed.proofs[0].signature).unwrap();
        let sig = Signature::from_der(&der).unwrap();
        let high_s = -*sig.s();
        let high_sig = Signature::from_scalars(sig.r().to_bytes(), high_s.to_bytes()).unwrap();
        assert!(bool::from(high_sig.s().is_high()));

        let tampered = Signed {
            value,
            proofs: vec![SignatureProof {
                id: signed.proofs[0].id.clone(),
                signature: hex::encode(high_sig.to_der().as_bytes()),
            }],
        };
        verify_signed(&tampered, false).unwrap();
    }

    #[test]
    fn tampered_value_fails_verification() {
        let kp = KeyPair::generate();
        let signed = sign_envelope(&kp, json!({"amount": 100}), false).unwrap();
        let forged = Signed {
            value: json!({"amount": 999}),
            proofs: signed.proofs,
        };
        assert!(matches!(
            verify_signed(&forged, false),
            Err(CryptoError::SignatureVerificationFailed(_))
        ));
    }

    #[test]
    fn empty_proof_set_is_rejected() {
        let signed: Signed<serde_json::Value> = Signed {
            value: json!({}),
            proofs: vec![],
        };
        assert!(verify_signed(&signed, false).is_err());
    }

    #[test]
    fn key_pair_restores_from_private_hex() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_private_hex(&kp.private_hex()).unwrap();
        assert_eq!(kp.address(), restored.address());
        assert_eq!(kp.public_hex(), restored.public_hex());
    }

    #[test]
    fn address_shape_is_stable() {
        let kp = KeyPair::generate();
        assert_eq!(kp.address().len(), 40);
        let from_proof = address_from_proof(&SignatureProof {
            id: kp.public_hex(),
            signature: String::new(),
        })
        .unwrap();
        assert_eq!(from_proof, kp.address());
    }
}
