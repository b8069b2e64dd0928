//! Publication of response part sequences.
//!
//! Every chunk becomes its own three-layer envelope (fresh throwaway wrap
//! key per chunk) and goes out to every configured relay concurrently.
//! Relay failures are isolated: a failing relay is logged and skipped.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use kh_crypto::{Keypair, PublicKey};
use kh_proto::wrap::{recipient_tags, wrap_payload};
use kh_proto::{ResponseMessage, KIND_HTTP_RESPONSE};

use crate::now_unix;
use crate::relays::RelayPool;

/// Builds and publishes outgoing response envelopes.
pub struct Publisher {
    keys: Arc<Keypair>,
    pool: Arc<dyn RelayPool>,
    relays: Vec<String>,
}

impl Publisher {
    pub fn new(keys: Arc<Keypair>, pool: Arc<dyn RelayPool>, relays: Vec<String>) -> Self {
        Self { keys, pool, relays }
    }

    /// Relay URLs fit for outbound hint tags.
    pub fn safe_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|u| is_safe_relay_url(u))
            .cloned()
            .collect()
    }

    /// Publish `chunks` to `requester`, in ascending part order.
    pub async fn publish_response(&self, requester: &PublicKey, chunks: &[ResponseMessage]) {
        let hints = self.safe_relays();

        for chunk in chunks {
            let content = match serde_json::to_string(chunk) {
                Ok(json) => json,
                Err(err) => {
                    warn!(request_id = %chunk.id, error = %err, "response chunk serialization failed");
                    return;
                }
            };

            let wrap = match wrap_payload(
                &self.keys,
                requester,
                KIND_HTTP_RESPONSE,
                content,
                recipient_tags(requester, &hints),
                now_unix(),
            ) {
                Ok(event) => event,
                Err(err) => {
                    warn!(request_id = %chunk.id, error = %err, "response envelope build failed");
                    return;
                }
            };

            let results = join_all(self.relays.iter().map(|relay| {
                let event = wrap.clone();
                async move { (relay, self.pool.publish(relay, event).await) }
            }))
            .await;

            for (relay, result) in results {
                match result {
                    Ok(()) => debug!(relay = %relay, wrap_id = %wrap.id, "response chunk published"),
                    Err(err) => warn!(relay = %relay, wrap_id = %wrap.id, error = %err, "publish failed"),
                }
            }
        }
    }
}

/// A relay URL is safe for hint tags iff it parses and carries neither
/// userinfo nor a query string.
pub fn is_safe_relay_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(u) => u.username().is_empty() && u.password().is_none() && u.query().is_none(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_relay_urls() {
        assert!(is_safe_relay_url("wss://relay.example"));
        assert!(is_safe_relay_url("wss://relay.example:7777/path"));
        assert!(!is_safe_relay_url("wss://user@relay.example"));
        assert!(!is_safe_relay_url("wss://user:pw@relay.example"));
        assert!(!is_safe_relay_url("wss://relay.example/?token=x"));
        assert!(!is_safe_relay_url("not a url"));
    }
}
