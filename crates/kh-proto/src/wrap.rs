//! Layered event construction and unwrapping.
//!
//! Three concentric envelopes with distinct key discipline:
//!
//! * **gift-wrap** — signed and sealed by a throwaway keypair generated
//!   per event, so the outer layer never reveals the real sender;
//! * **seal** — signed by the sender's long-lived key and sealed with its
//!   key agreement secret, `created_at` backdated by a random amount to
//!   break timing correlation with the wrap;
//! * **inner** — the HTTP payload event, unsigned, authenticated by the seal.
//!
//! Each sealed payload embeds the sealing key's X25519 public, so the
//! recipient opens every layer with nothing but its own secret. Opening a
//! seal also yields the sender's key agreement key, which is where the
//! gateway learns how to seal the response back.

use kh_crypto::{open, seal_to, CryptoError, Keypair, PublicKey};

use crate::event::{Event, UnsignedEvent, KIND_GIFT_WRAP, KIND_SEAL};

/// Upper bound on the random seal backdating interval (48 h).
const SEAL_BACKDATE_SECS: u64 = 48 * 60 * 60;

/// Errors while building outgoing envelopes.
#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors while opening incoming envelopes. Every variant maps to a silent
/// drop in the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UnwrapError {
    #[error("unexpected kind {got}, wanted {want}")]
    WrongKind { got: u32, want: u32 },
    #[error("{layer} layer decrypt failed")]
    Decrypt { layer: &'static str },
    #[error("malformed {layer} payload: {reason}")]
    Malformed { layer: &'static str, reason: String },
    #[error("seal verification failed")]
    BadSeal,
    #[error("inner pubkey does not match seal pubkey")]
    IdentityMismatch,
}

/// Seal `inner` to `recipient`, signing with the sender's long-lived key.
pub fn seal(
    sender: &Keypair,
    recipient: &PublicKey,
    inner: &UnsignedEvent,
    created_at: i64,
) -> Result<Event, WrapError> {
    let content = seal_to(
        inner.to_json().as_bytes(),
        sender.kex_secret(),
        &recipient.kex_bytes(),
    )?;
    Ok(Event::build(sender, KIND_SEAL, vec![], content, created_at))
}

/// Wrap a seal for `recipient` under a fresh throwaway keypair.
pub fn gift_wrap(
    recipient: &PublicKey,
    sealed: &Event,
    tags: Vec<Vec<String>>,
    created_at: i64,
) -> Result<Event, WrapError> {
    let throwaway = Keypair::generate();
    let content = seal_to(
        sealed.to_json().as_bytes(),
        throwaway.kex_secret(),
        &recipient.kex_bytes(),
    )?;
    Ok(Event::build(
        &throwaway,
        KIND_GIFT_WRAP,
        tags,
        content,
        created_at,
    ))
}

/// Build the full three-layer envelope around an inner payload event.
///
/// `inner_kind` is [`crate::event::KIND_HTTP_REQUEST`] on the client side
/// and [`crate::event::KIND_HTTP_RESPONSE`] on the gateway side; `content`
/// is the JSON part message. The seal timestamp is drawn from
/// `[now - 48 h, now]`.
pub fn wrap_payload(
    sender: &Keypair,
    recipient: &PublicKey,
    inner_kind: u32,
    content: String,
    tags: Vec<Vec<String>>,
    now: i64,
) -> Result<Event, WrapError> {
    let inner = UnsignedEvent::build(sender.public_hex(), inner_kind, vec![], content, now);
    let sealed = seal(sender, recipient, &inner, backdated(now))?;
    gift_wrap(recipient, &sealed, tags, now)
}

/// Open a gift-wrap addressed to `our` identity, returning the verified seal.
pub fn unwrap_gift(our: &Keypair, wrap: &Event) -> Result<Event, UnwrapError> {
    if wrap.kind != KIND_GIFT_WRAP {
        return Err(UnwrapError::WrongKind {
            got: wrap.kind,
            want: KIND_GIFT_WRAP,
        });
    }

    let (plain, _throwaway_kex) = open(&wrap.content, our.kex_secret())
        .map_err(|_| UnwrapError::Decrypt { layer: "wrap" })?;

    let sealed: Event = serde_json::from_slice(&plain).map_err(|e| UnwrapError::Malformed {
        layer: "seal",
        reason: e.to_string(),
    })?;
    if sealed.kind != KIND_SEAL {
        return Err(UnwrapError::WrongKind {
            got: sealed.kind,
            want: KIND_SEAL,
        });
    }
    sealed.verify().map_err(|_| UnwrapError::BadSeal)?;
    Ok(sealed)
}

/// Decrypt a verified seal, returning the inner event and the sealer's
/// key agreement public key. Enforces the identity binding
/// `inner.pubkey == seal.pubkey`.
pub fn open_seal(
    our: &Keypair,
    sealed: &Event,
) -> Result<(UnsignedEvent, [u8; 32]), UnwrapError> {
    let (plain, sender_kex) = open(&sealed.content, our.kex_secret())
        .map_err(|_| UnwrapError::Decrypt { layer: "seal" })?;

    let inner: UnsignedEvent = serde_json::from_slice(&plain).map_err(|e| UnwrapError::Malformed {
        layer: "inner",
        reason: e.to_string(),
    })?;
    if inner.pubkey != sealed.pubkey {
        return Err(UnwrapError::IdentityMismatch);
    }
    Ok((inner, sender_kex))
}

/// Hint tags for an outgoing wrap: `["p", <recipient>, <first safe relay>]`
/// plus a `["relays", ...]` tag when more hints are known.
pub fn recipient_tags(recipient: &PublicKey, safe_relays: &[String]) -> Vec<Vec<String>> {
    let mut p_tag = vec!["p".to_string(), recipient.to_hex()];
    if let Some(first) = safe_relays.first() {
        p_tag.push(first.clone());
    }
    let mut tags = vec![p_tag];
    if safe_relays.len() > 1 {
        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(safe_relays[1..].iter().cloned());
        tags.push(relays_tag);
    }
    tags
}

/// `now` minus a uniform random offset in `[0, 48 h)`.
fn backdated(now: i64) -> i64 {
    let mut buf = [0u8; 8];
    // On entropy failure fall back to no backdating rather than refusing to
    // respond; the offset is a privacy measure, not a correctness one.
    if getrandom::getrandom(&mut buf).is_err() {
        return now;
    }
    let offset = u64::from_le_bytes(buf) % SEAL_BACKDATE_SECS;
    now - offset as i64
}
