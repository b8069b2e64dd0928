//! WebSocket relay pool.
//!
//! One task per relay owns the socket: it speaks `["REQ", ..]` /
//! `["CLOSE", ..]` for subscriptions, `["EVENT", ..]` with `["OK", ..]`
//! acknowledgments for publishes, and reconnects with capped exponential
//! backoff. Subscriptions live in shared pool state so a reconnecting
//! relay can replay them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use kh_core::{AlreadyHave, PoolError, PublishError, RelayPool, Subscription};
use kh_proto::{Event, SubscriptionFilter};

const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum RelayCmd {
    Publish {
        event: Event,
        ack: oneshot::Sender<Result<(), PublishError>>,
    },
    Open {
        sub_id: String,
        filter: SubscriptionFilter,
    },
    Close {
        sub_id: String,
    },
    Shutdown,
}

struct SubEntry {
    filter: SubscriptionFilter,
    relays: Vec<String>,
    already_have: AlreadyHave,
    events: mpsc::Sender<Event>,
}

struct RelayHandle {
    cmd_tx: mpsc::UnboundedSender<RelayCmd>,
    connected: Arc<AtomicBool>,
}

struct PoolInner {
    relays: Mutex<HashMap<String, RelayHandle>>,
    subs: Mutex<HashMap<String, SubEntry>>,
    next_sub: AtomicU64,
    closed: AtomicBool,
}

/// Production [`RelayPool`] over tokio-tungstenite.
pub struct WsRelayPool {
    inner: Arc<PoolInner>,
}

impl Default for WsRelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WsRelayPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                relays: Mutex::new(HashMap::new()),
                subs: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn handle_cmd_tx(&self, url: &str) -> Option<(mpsc::UnboundedSender<RelayCmd>, bool)> {
        let relays = self.inner.relays.lock().unwrap();
        relays
            .get(url)
            .map(|h| (h.cmd_tx.clone(), h.connected.load(Ordering::Relaxed)))
    }
}

#[async_trait]
impl RelayPool for WsRelayPool {
    async fn ensure_relay(&self, url: &str) -> Result<(), PoolError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(PoolError::Closed);
        }
        let parsed = url::Url::parse(url).map_err(|_| PoolError::BadUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(PoolError::BadUrl(url.to_string()));
        }

        let mut relays = self.inner.relays.lock().unwrap();
        if !relays.contains_key(url) {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let connected = Arc::new(AtomicBool::new(false));
            let task_url = url.to_string();
            let task_connected = Arc::clone(&connected);
            let task_inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                relay_task(task_url, cmd_rx, task_connected, task_inner).await;
            });
            relays.insert(url.to_string(), RelayHandle { cmd_tx, connected });
        }
        Ok(())
    }

    async fn is_connected(&self, url: &str) -> bool {
        self.handle_cmd_tx(url)
            .map(|(_, connected)| connected)
            .unwrap_or(false)
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filter: SubscriptionFilter,
        already_have: AlreadyHave,
        events: mpsc::Sender<Event>,
    ) -> Result<Box<dyn Subscription>, PoolError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(PoolError::Closed);
        }

        let sub_id = format!("kh{}", self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
        self.inner.subs.lock().unwrap().insert(
            sub_id.clone(),
            SubEntry {
                filter: filter.clone(),
                relays: relays.to_vec(),
                already_have,
                events,
            },
        );

        for url in relays {
            if let Err(err) = self.ensure_relay(url).await {
                self.inner.subs.lock().unwrap().remove(&sub_id);
                return Err(err);
            }
            if let Some((cmd_tx, _)) = self.handle_cmd_tx(url) {
                let _ = cmd_tx.send(RelayCmd::Open {
                    sub_id: sub_id.clone(),
                    filter: filter.clone(),
                });
            }
        }

        Ok(Box::new(WsSubscription {
            inner: Arc::clone(&self.inner),
            sub_id,
        }))
    }

    async fn publish(&self, relay: &str, event: Event) -> Result<(), PublishError> {
        let Some((cmd_tx, _)) = self.handle_cmd_tx(relay) else {
            return Err(PublishError::NotConnected);
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(RelayCmd::Publish {
                event,
                ack: ack_tx,
            })
            .map_err(|_| PublishError::NotConnected)?;

        match timeout(PUBLISH_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::Transport("connection lost".into())),
            Err(_) => Err(PublishError::Timeout),
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        let relays = self.inner.relays.lock().unwrap();
        for handle in relays.values() {
            let _ = handle.cmd_tx.send(RelayCmd::Shutdown);
        }
    }
}

struct WsSubscription {
    inner: Arc<PoolInner>,
    sub_id: String,
}

#[async_trait]
impl Subscription for WsSubscription {
    async fn close(self: Box<Self>) {
        let entry = self.inner.subs.lock().unwrap().remove(&self.sub_id);
        let Some(entry) = entry else { return };

        let senders: Vec<_> = {
            let relays = self.inner.relays.lock().unwrap();
            entry
                .relays
                .iter()
                .filter_map(|url| relays.get(url).map(|h| h.cmd_tx.clone()))
                .collect()
        };
        for cmd_tx in senders {
            let _ = cmd_tx.send(RelayCmd::Close {
                sub_id: self.sub_id.clone(),
            });
        }
    }
}

/// Owns one relay socket for its whole lifetime, reconnecting until told
/// to shut down.
async fn relay_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCmd>,
    connected: Arc<AtomicBool>,
    inner: Arc<PoolInner>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(relay = %url, error = %err, "relay connect failed");
                if idle_until_retry(&mut cmd_rx, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        info!(relay = %url, "relay connected");
        connected.store(true, Ordering::Relaxed);
        backoff = INITIAL_BACKOFF;

        let shutdown = drive_connection(&url, stream, &mut cmd_rx, &inner).await;
        connected.store(false, Ordering::Relaxed);
        if shutdown {
            return;
        }
        warn!(relay = %url, "relay disconnected, will reconnect");
    }
}

/// While disconnected, answer publishes with `NotConnected` instead of
/// letting them pile up. Returns true on shutdown.
async fn idle_until_retry(cmd_rx: &mut mpsc::UnboundedReceiver<RelayCmd>, wait: Duration) -> bool {
    let deadline = sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(RelayCmd::Shutdown) => return true,
                Some(RelayCmd::Publish { ack, .. }) => {
                    let _ = ack.send(Err(PublishError::NotConnected));
                }
                // Subscriptions are replayed from pool state on connect.
                Some(RelayCmd::Open { .. }) | Some(RelayCmd::Close { .. }) => {}
            }
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Run one live connection until it drops or the pool shuts down.
/// Returns true on shutdown.
async fn drive_connection(
    url: &str,
    stream: WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<RelayCmd>,
    inner: &Arc<PoolInner>,
) -> bool {
    let (mut ws_tx, mut ws_rx) = stream.split();
    let mut pending_acks: HashMap<String, oneshot::Sender<Result<(), PublishError>>> =
        HashMap::new();

    // Replay the subscriptions this relay participates in.
    let replay: Vec<(String, SubscriptionFilter)> = {
        let subs = inner.subs.lock().unwrap();
        subs.iter()
            .filter(|(_, entry)| entry.relays.iter().any(|r| r == url))
            .map(|(sub_id, entry)| (sub_id.clone(), entry.filter.clone()))
            .collect()
    };
    for (sub_id, filter) in replay {
        let frame = json!(["REQ", sub_id, filter]).to_string();
        if ws_tx.send(Message::Text(frame)).await.is_err() {
            return false;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(RelayCmd::Shutdown) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return true;
                }
                Some(RelayCmd::Publish { event, ack }) => {
                    let id = event.id.clone();
                    let frame = json!(["EVENT", event]).to_string();
                    pending_acks.insert(id.clone(), ack);
                    if let Err(err) = ws_tx.send(Message::Text(frame)).await {
                        if let Some(ack) = pending_acks.remove(&id) {
                            let _ = ack.send(Err(PublishError::Transport(err.to_string())));
                        }
                        return false;
                    }
                }
                Some(RelayCmd::Open { sub_id, filter }) => {
                    let frame = json!(["REQ", sub_id, filter]).to_string();
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        return false;
                    }
                }
                Some(RelayCmd::Close { sub_id }) => {
                    let frame = json!(["CLOSE", sub_id]).to_string();
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        return false;
                    }
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(url, &text, inner, &mut pending_acks).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if ws_tx.send(Message::Pong(payload)).await.is_err() {
                        return false;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(relay = %url, error = %err, "relay read error");
                    return false;
                }
            }
        }
    }
}

async fn handle_frame(
    url: &str,
    text: &str,
    inner: &Arc<PoolInner>,
    pending_acks: &mut HashMap<String, oneshot::Sender<Result<(), PublishError>>>,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            debug!(relay = %url, error = %err, "unparseable relay frame");
            return;
        }
    };
    let Some(items) = value.as_array() else { return };
    let Some(tag) = items.first().and_then(Value::as_str) else {
        return;
    };

    match tag {
        "EVENT" => {
            let (Some(sub_id), Some(raw)) = (items.get(1).and_then(Value::as_str), items.get(2))
            else {
                return;
            };
            let event: Event = match serde_json::from_value(raw.clone()) {
                Ok(ev) => ev,
                Err(err) => {
                    debug!(relay = %url, error = %err, "malformed event in frame");
                    return;
                }
            };
            if let Err(err) = event.verify() {
                debug!(relay = %url, event_id = %event.id, error = %err, "event failed verification");
                return;
            }

            let target = {
                let subs = inner.subs.lock().unwrap();
                subs.get(sub_id)
                    .map(|entry| (Arc::clone(&entry.already_have), entry.events.clone()))
            };
            let Some((already_have, events)) = target else {
                return;
            };
            if already_have(&event.id) {
                return;
            }
            let _ = events.send(event).await;
        }
        "OK" => {
            let (Some(event_id), accepted) = (
                items.get(1).and_then(Value::as_str),
                items.get(2).and_then(Value::as_bool).unwrap_or(false),
            ) else {
                return;
            };
            if let Some(ack) = pending_acks.remove(event_id) {
                let result = if accepted {
                    Ok(())
                } else {
                    let reason = items
                        .get(3)
                        .and_then(Value::as_str)
                        .unwrap_or("rejected")
                        .to_string();
                    Err(PublishError::Rejected(reason))
                };
                let _ = ack.send(result);
            }
        }
        "EOSE" => debug!(relay = %url, "end of stored events"),
        "NOTICE" => {
            let msg = items.get(1).and_then(Value::as_str).unwrap_or_default();
            info!(relay = %url, notice = %msg, "relay notice");
        }
        "CLOSED" => {
            let sub_id = items.get(1).and_then(Value::as_str).unwrap_or_default();
            warn!(relay = %url, sub_id = %sub_id, "relay closed subscription");
        }
        other => debug!(relay = %url, frame = %other, "unhandled relay frame"),
    }
}
