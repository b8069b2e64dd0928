//! Cryptographic primitives for the keyhole relay gateway.
//!
//! An identity carries an Ed25519 signing key and an X25519 key agreement
//! key, both derived from one 32-byte seed. Payloads travel as sealed
//! boxes: X25519 Diffie-Hellman between the sender's key agreement secret
//! and the recipient's public, HKDF-SHA256 key expansion, and
//! ChaCha20-Poly1305 with a random nonce, with the sender's X25519 public
//! embedded in the wire form so the recipient can derive the same key.

#![forbid(unsafe_code)]

pub mod hash;
pub mod keys;
pub mod secretbox;

pub use keys::{verify_signature, Keypair, PublicKey};
pub use secretbox::{open, seal_to, MAX_PLAINTEXT};

/// Error type for all crypto operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed")]
    Decrypt,
    #[error("signature verification failed")]
    Verify,
    #[error("malformed input: {0}")]
    Format(&'static str),
    #[error("plaintext exceeds {} bytes", secretbox::MAX_PLAINTEXT)]
    PlaintextTooLarge,
}
