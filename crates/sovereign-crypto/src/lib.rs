//! # Sovereign Crypto
//!
//! Cryptographic building blocks of the federation engine.
//!
//! | Concern | Primitive |
//! |---------|-----------|
//! | Identifiers and chain hashes | BLAKE3 |
//! | Vote and challenge signatures | Ed25519 |
//! | Contribution attestation | keyed BLAKE3 (software), or any [`AttestationService`] |

pub mod error;
pub mod hash;
pub mod keys;
pub mod services;

pub use error::{CryptoError, Result};
pub use hash::*;
pub use keys::{KeyPair, PublicKey, Signature};
pub use services::{
    AttestationService, Ed25519Verifier, KeyedAttestor, Proof, SignatureService,
    SignatureVerifier,
};
