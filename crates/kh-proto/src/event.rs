//! The wire event entity and its canonical id.
//!
//! An event id is the SHA-256 of the compact JSON array
//! `[0, pubkey, created_at, kind, tags, content]`; the signature is
//! Ed25519 over the 32 raw id bytes. Inner HTTP payload events travel
//! unsigned; they are authenticated transitively by the seal that carries
//! them.

use serde::{Deserialize, Serialize};

use kh_crypto::hash::sha256;
use kh_crypto::{verify_signature, CryptoError, Keypair};

/// Ephemeral, random-keyed outer envelope addressed via a `p` tag.
pub const KIND_GIFT_WRAP: u32 = 21059;
/// Long-lived-key-signed envelope whose content is an inner event.
pub const KIND_SEAL: u32 = 13;
/// Inner payload: one part of an HTTP request.
pub const KIND_HTTP_REQUEST: u32 = 80;
/// Inner payload: one part of an HTTP response.
pub const KIND_HTTP_RESPONSE: u32 = 81;

/// Error type for event parsing and verification.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("event id does not match event contents")]
    IdMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("invalid event json: {0}")]
    Json(String),
}

/// A signed wire event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// An inner event: same shape as [`Event`] but never signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Canonical serialization used for hashing: a fixed array form encoded as
/// compact JSON with no extra whitespace.
fn canonical_preimage(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))
        .unwrap() // arrays of strings and integers cannot fail to serialize
}

/// Compute the canonical hex event id.
pub fn compute_id(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    hex::encode(sha256(
        canonical_preimage(pubkey, created_at, kind, tags, content).as_bytes(),
    ))
}

impl Event {
    /// Build and sign an event with `keys`.
    pub fn build(
        keys: &Keypair,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: i64,
    ) -> Self {
        let pubkey = keys.public_hex();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        let id_bytes = hex::decode(&id).unwrap(); // we just produced valid hex
        let sig = hex::encode(keys.sign(&id_bytes));
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        }
    }

    /// Verify the event: the id must match the contents and the signature
    /// must check out against `pubkey`.
    pub fn verify(&self) -> Result<(), CodecError> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if expected != self.id {
            return Err(CodecError::IdMismatch);
        }

        let id_bytes =
            hex::decode(&self.id).map_err(|_| CryptoError::Format("event id is not hex"))?;
        let sig_bytes =
            hex::decode(&self.sig).map_err(|_| CryptoError::Format("signature is not hex"))?;
        let pub_bytes: [u8; 32] = hex::decode(&self.pubkey)
            .map_err(|_| CryptoError::Format("pubkey is not hex"))?
            .try_into()
            .map_err(|_| CryptoError::Format("pubkey must be 32 bytes"))?;
        verify_signature(&pub_bytes, &id_bytes, &sig_bytes)?;
        Ok(())
    }

    pub fn from_json(s: &str) -> Result<Self, CodecError> {
        serde_json::from_str(s).map_err(|e| CodecError::Json(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap() // struct of plain fields, infallible
    }
}

impl UnsignedEvent {
    /// Build an inner event with its id computed but no signature.
    pub fn build(
        pubkey: String,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: i64,
    ) -> Self {
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}
