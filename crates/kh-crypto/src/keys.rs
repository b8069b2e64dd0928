//! Identity keypair management.
//!
//! An identity carries two keys derived from one 32-byte seed: an Ed25519
//! signing key (its public half is the event `pubkey`) and an X25519 key
//! agreement key used by the sealed-box payload encryption. The X25519
//! public half never appears in event fields; it travels inside sealed
//! payloads, so parties learn it when they first decrypt something from
//! the peer. Both key types zeroize their secret material on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::CryptoError;

/// A long-lived (or throwaway) identity keypair.
pub struct Keypair {
    sign_key: SigningKey,
    kex_key: StaticSecret,
}

impl Keypair {
    /// Generate a fresh random keypair from the OS entropy source.
    ///
    /// Used both for long-lived identities and for the throwaway keys that
    /// sign outgoing gift-wraps.
    pub fn generate() -> Self {
        Self::from_secret_bytes(&SigningKey::generate(&mut OsRng).to_bytes())
    }

    /// Rebuild a keypair from its 32-byte secret seed.
    pub fn from_secret_bytes(seed: &[u8; 32]) -> Self {
        Self {
            sign_key: SigningKey::from_bytes(seed),
            kex_key: StaticSecret::from(*seed),
        }
    }

    /// Rebuild a keypair from a 64-char hex secret.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = hex::decode(s.trim())
            .map_err(|_| CryptoError::Format("secret key is not valid hex"))?
            .try_into()
            .map_err(|_| CryptoError::Format("secret key must be 32 bytes"))?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// The 32-byte secret seed.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.sign_key.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        PublicKey {
            sign: self.sign_key.verifying_key(),
            kex: X25519PublicKey::from(&self.kex_key),
        }
    }

    /// Hex form of the signing public key, as carried in event `pubkey`
    /// fields.
    pub fn public_hex(&self) -> String {
        hex::encode(self.sign_key.verifying_key().to_bytes())
    }

    /// The X25519 key agreement public key bytes.
    pub fn kex_pub(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.kex_key).as_bytes()
    }

    /// The X25519 secret, for opening sealed payloads.
    pub fn kex_secret(&self) -> &StaticSecret {
        &self.kex_key
    }

    /// Sign a 32-byte event id. Returns the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let sig: Signature = self.sign_key.sign(message);
        sig.to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        f.debug_struct("Keypair")
            .field("public", &self.public_hex())
            .finish()
    }
}

/// A peer's public identity: the Ed25519 signing key plus the X25519 key
/// agreement key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    sign: VerifyingKey,
    kex: X25519PublicKey,
}

impl PublicKey {
    /// Assemble an identity from the event-field hex signing key and the
    /// key agreement key learned from a sealed payload.
    pub fn from_hex_parts(sign_hex: &str, kex_pub: &[u8; 32]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = hex::decode(sign_hex)
            .map_err(|_| CryptoError::Format("public key is not valid hex"))?
            .try_into()
            .map_err(|_| CryptoError::Format("public key must be 32 bytes"))?;
        let sign = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| CryptoError::Format("public key is not a valid curve point"))?;
        Ok(Self {
            sign,
            kex: X25519PublicKey::from(*kex_pub),
        })
    }

    /// Hex form of the signing half, as carried in event `pubkey` fields.
    pub fn to_hex(&self) -> String {
        hex::encode(self.sign.to_bytes())
    }

    /// The signing public key bytes.
    pub fn as_bytes(&self) -> [u8; 32] {
        self.sign.to_bytes()
    }

    /// The key agreement public key bytes.
    pub fn kex_bytes(&self) -> [u8; 32] {
        *self.kex.as_bytes()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Verify a 64-byte Ed25519 signature over `message`.
pub fn verify_signature(
    sign_pub: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(sign_pub)
        .map_err(|_| CryptoError::Format("public key is not a valid curve point"))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::Format("signature must be 64 bytes"))?;
    let sig = Signature::from_bytes(&sig_bytes);
    vk.verify_strict(message, &sig)
        .map_err(|_| CryptoError::Verify)
}
