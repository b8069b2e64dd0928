//! The injected relay pool interface.
//!
//! The gateway binary supplies a WebSocket implementation; tests supply an
//! in-memory one. Events are delivered over an mpsc channel; the
//! `already_have` callback lets the transport skip ids the pipeline has
//! seen, before the event is re-fetched or re-parsed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kh_proto::{Event, SubscriptionFilter};

use crate::errors::{PoolError, PublishError};

/// Transport-side duplicate suppression callback.
pub type AlreadyHave = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Handle for one live subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Close the subscription. Events already in flight may still arrive
    /// on the channel.
    async fn close(self: Box<Self>);
}

/// The relay pool the pipeline drives.
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Open (or re-open) the connection to `url`.
    async fn ensure_relay(&self, url: &str) -> Result<(), PoolError>;

    /// Whether `url` currently has a live connection.
    async fn is_connected(&self, url: &str) -> bool;

    /// Subscribe on every listed relay; matching events are sent to
    /// `events`, except those whose id `already_have` claims.
    async fn subscribe(
        &self,
        relays: &[String],
        filter: SubscriptionFilter,
        already_have: AlreadyHave,
        events: mpsc::Sender<Event>,
    ) -> Result<Box<dyn Subscription>, PoolError>;

    /// Publish `event` to a single relay.
    async fn publish(&self, relay: &str, event: Event) -> Result<(), PublishError>;

    /// Tear down every connection.
    async fn close(&self);
}
