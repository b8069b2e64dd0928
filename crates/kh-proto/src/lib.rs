//! Wire model for the keyhole relay gateway.
//!
//! This crate defines the three event shapes that cross the relay network
//! (gift-wrap, seal, inner HTTP payload), the part messages carried inside
//! inner events, subscription filters, and the nprofile identity artifact.
//! Everything here is pure data and crypto composition; no I/O.

#![forbid(unsafe_code)]

pub mod event;
pub mod filter;
pub mod message;
pub mod nprofile;
pub mod wrap;

pub use event::{
    Event, UnsignedEvent, KIND_GIFT_WRAP, KIND_HTTP_REQUEST, KIND_HTTP_RESPONSE, KIND_SEAL,
};
pub use filter::SubscriptionFilter;
pub use message::{RequestMessage, ResponseMessage, MAX_MESSAGE_ID_LEN};
pub use wrap::{UnwrapError, WrapError};
