//! The bech32 `nprofile` identity artifact: public key plus relay hints.
//!
//! TLV layout: type 0 carries the 32-byte public key, type 1 one relay URL
//! per entry, each length-prefixed.

use bech32::{ToBase32, Variant};

use kh_crypto::PublicKey;

const TLV_PUBKEY: u8 = 0;
const TLV_RELAY: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum NprofileError {
    #[error("relay url exceeds 255 bytes: {0}")]
    RelayTooLong(String),
    #[error("bech32 encoding failed: {0}")]
    Encode(String),
}

/// Encode an nprofile from a public key and its relay hints.
pub fn encode(pubkey: &PublicKey, relays: &[String]) -> Result<String, NprofileError> {
    let mut data = Vec::with_capacity(34 + relays.iter().map(|r| r.len() + 2).sum::<usize>());
    data.push(TLV_PUBKEY);
    data.push(32);
    data.extend_from_slice(&pubkey.as_bytes());

    for relay in relays {
        let bytes = relay.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(NprofileError::RelayTooLong(relay.clone()));
        }
        data.push(TLV_RELAY);
        data.push(bytes.len() as u8);
        data.extend_from_slice(bytes);
    }

    bech32::encode("nprofile", data.to_base32(), Variant::Bech32)
        .map_err(|e| NprofileError::Encode(e.to_string()))
}
