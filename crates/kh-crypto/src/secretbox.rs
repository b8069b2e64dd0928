//! Sealed-box payload encryption.
//!
//! Wire form: `base64(sender_kex_pub(32) || nonce(12) || ciphertext || tag(16))`.
//! The sender performs X25519 Diffie-Hellman between its key agreement
//! secret and the recipient's key agreement public, expands the shared
//! secret with HKDF-SHA256, and encrypts under ChaCha20-Poly1305 with a
//! fresh random nonce. Embedding the sender's X25519 public in the
//! payload lets the recipient derive the same key with nothing but its
//! own secret, and tells it where to send sealed replies. The derived key
//! is symmetric in (sender, recipient), so either side of a conversation
//! can seal to the other.

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::CryptoError;

/// Ciphertext ceiling imposed by the encryption scheme. Plaintexts longer
/// than this are refused; callers must chunk above it.
pub const MAX_PLAINTEXT: usize = 65_535;

const KEX_PUB_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const KDF_SALT: &[u8] = b"keyhole-box-v1";
const KDF_INFO: &[u8] = b"payload-key";

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

fn derive_key(shared: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared);
    let mut key = [0u8; 32];
    hk.expand(KDF_INFO, &mut key)
        .unwrap(); // output size matches digest size, infallible
    key
}

/// Seal `plaintext` from `sender` to `recipient_kex_pub`, producing the
/// base64 wire string.
pub fn seal_to(
    plaintext: &[u8],
    sender: &StaticSecret,
    recipient_kex_pub: &[u8; 32],
) -> Result<String, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT {
        return Err(CryptoError::PlaintextTooLarge);
    }

    let shared = sender.diffie_hellman(&X25519PublicKey::from(*recipient_kex_pub));
    let key = derive_key(shared.as_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::Format("entropy unavailable"))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Format("encryption failed"))?;

    let sender_pub = X25519PublicKey::from(sender);
    let mut out = Vec::with_capacity(KEX_PUB_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(sender_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(B64.encode(out))
}

/// Open a base64 wire string produced by [`seal_to`]. Returns the
/// plaintext and the sender's key agreement public key.
pub fn open(payload: &str, recipient: &StaticSecret) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let raw = B64
        .decode(payload)
        .map_err(|_| CryptoError::Format("ciphertext is not valid base64"))?;
    if raw.len() < KEX_PUB_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Format("ciphertext too short"));
    }

    let (kex, rest) = raw.split_at(KEX_PUB_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let mut sender_pub = [0u8; 32];
    sender_pub.copy_from_slice(kex);

    let shared = recipient.diffie_hellman(&X25519PublicKey::from(sender_pub));
    let key = derive_key(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok((plaintext, sender_pub))
}
