//! Injectable signing and attestation services
//!
//! The engine never depends on a concrete scheme: it signs through
//! [`SignatureService`], checks signatures through [`SignatureVerifier`] and
//! treats attestation as an opaque [`AttestationService`].

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::hash::IncrementalHasher;
use crate::keys::{KeyPair, PublicKey, Signature};

/// Produces signatures with the local node's private key
pub trait SignatureService: Send + Sync {
    fn sign(&self, message: &[u8]) -> Signature;
    fn public_key(&self) -> PublicKey;
}

impl SignatureService for KeyPair {
    fn sign(&self, message: &[u8]) -> Signature {
        KeyPair::sign(self, message)
    }

    fn public_key(&self) -> PublicKey {
        KeyPair::public_key(self)
    }
}

/// Checks a signature against a registered public key
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()>;
}

/// Ed25519 verification
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
        key.verify(message, signature)
    }
}

/// Opaque attestation proof over a contribution payload
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Proof(#[serde(with = "serde_bytes")] Vec<u8>);

impl Proof {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Proof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "Proof({})", &hex[..hex.len().min(16)])
    }
}

/// `Attest(payload) -> proof` / `VerifyProof(proof) -> bool`
pub trait AttestationService: Send + Sync {
    fn attest(&self, payload: &[u8]) -> Proof;

    fn verify_proof(&self, payload: &[u8], proof: &Proof) -> bool;

    /// `verify_proof` as a `Result`
    fn check(&self, payload: &[u8], proof: &Proof) -> Result<()> {
        if self.verify_proof(payload, proof) {
            Ok(())
        } else {
            Err(CryptoError::ProofRejected)
        }
    }
}

const ATTESTATION_DOMAIN: &str = "sovereign.attestation.v1";

#[derive(Zeroize, ZeroizeOnDrop)]
struct AttestationKey([u8; 32]);

/// Software attestor: a keyed BLAKE3 MAC under a federation-wide key.
///
/// Stands in for a hardware quote where no enclave is available. Every
/// member holding the key can both attest and verify.
pub struct KeyedAttestor {
    key: AttestationKey,
}

impl KeyedAttestor {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: AttestationKey(key),
        }
    }

    /// Derive the attestation key from a shared federation secret
    pub fn from_secret(secret: &[u8]) -> Self {
        Self::new(crate::hash::derive_key(ATTESTATION_DOMAIN, secret))
    }

    fn mac(&self, payload: &[u8]) -> [u8; 32] {
        let mut hasher = IncrementalHasher::new_keyed(&self.key.0);
        hasher.update_framed(ATTESTATION_DOMAIN.as_bytes());
        hasher.update_framed(payload);
        hasher.finalize()
    }
}

impl AttestationService for KeyedAttestor {
    fn attest(&self, payload: &[u8]) -> Proof {
        Proof(self.mac(payload).to_vec())
    }

    fn verify_proof(&self, payload: &[u8], proof: &Proof) -> bool {
        let expected = self.mac(payload);
        if proof.0.len() != expected.len() {
            return false;
        }
        // Constant time comparison
        proof
            .0
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
