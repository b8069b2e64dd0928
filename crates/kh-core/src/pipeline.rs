//! The pipeline orchestrator.
//!
//! One long-lived task owns the subscription and the periodic maintenance
//! timers; each delivered event is handled on its own task. Shared state
//! (the two dedup maps, the reassembly buffer, the time cursor) sits
//! behind short-critical-section locks that are never held across await
//! points.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use kh_crypto::{Keypair, PublicKey};
use kh_proto::wrap::{open_seal, unwrap_gift};
use kh_proto::{nprofile, Event, RequestMessage, SubscriptionFilter, KIND_HTTP_REQUEST};

use crate::chunker::chunk_response;
use crate::dedup::SeenMap;
use crate::errors::{DropReason, PipelineError};
use crate::now_unix;
use crate::origin::{OriginClient, OriginRequest, OriginResponse};
use crate::publish::{is_safe_relay_url, Publisher};
use crate::reassembly::{assemble, CompleteRequest, ReassemblyBuffer, REASSEMBLY_TTL};
use crate::relays::{AlreadyHave, RelayPool, Subscription};
use crate::routes::RouteGate;
use crate::transform::{ResponseTransformer, TransformContext};

/// Inner events may lead the local clock by at most this much.
const MAX_FUTURE_SKEW: i64 = 600;
/// Lag between the wall clock and the admission cursor.
const CURSOR_LAG: i64 = 60;
/// Subscription lookback and wrap-dedup retention.
const LOOKBACK: i64 = 48 * 60 * 60;

const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const WRAP_COMPACT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const REQUEST_COMPACT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const REASSEMBLY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the orchestrator needs to know at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Origin URL prefix requests are dispatched against.
    pub destination: String,
    /// Relay URLs to subscribe and publish on.
    pub relays: Vec<String>,
    /// Route glob patterns; `!` prefix negates.
    pub allowed_routes: Vec<String>,
    /// Origin request timeout.
    pub timeout: Duration,
    /// Cap on relay hints advertised in the nprofile.
    pub nprofile_max_relays: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            relays: Vec::new(),
            allowed_routes: Vec::new(),
            timeout: Duration::from_millis(300_000),
            nprofile_max_relays: 3,
        }
    }
}

/// The event pipeline orchestrator.
pub struct Pipeline {
    keys: Arc<Keypair>,
    config: PipelineConfig,
    gate: RouteGate,
    pool: Arc<dyn RelayPool>,
    origin: Arc<dyn OriginClient>,
    transformer: Option<Arc<dyn ResponseTransformer>>,
    publisher: Publisher,
    wrap_seen: Arc<Mutex<SeenMap>>,
    request_seen: Mutex<SeenMap>,
    reassembly: Mutex<ReassemblyBuffer>,
    /// Lower bound on accepted inner timestamps; advances with compaction.
    oldest_time: AtomicI64,
    nprofile: OnceLock<String>,
}

impl Pipeline {
    pub fn new(
        keys: Keypair,
        config: PipelineConfig,
        pool: Arc<dyn RelayPool>,
        origin: Arc<dyn OriginClient>,
        transformer: Option<Arc<dyn ResponseTransformer>>,
    ) -> Result<Self, PipelineError> {
        let gate = RouteGate::new(&config.allowed_routes)?;
        let keys = Arc::new(keys);
        let publisher = Publisher::new(Arc::clone(&keys), Arc::clone(&pool), config.relays.clone());

        Ok(Self {
            keys,
            config,
            gate,
            pool,
            origin,
            transformer,
            publisher,
            wrap_seen: Arc::new(Mutex::new(SeenMap::new())),
            request_seen: Mutex::new(SeenMap::new()),
            reassembly: Mutex::new(ReassemblyBuffer::new(REASSEMBLY_TTL)),
            oldest_time: AtomicI64::new(now_unix() - CURSOR_LAG),
            nprofile: OnceLock::new(),
        })
    }

    /// The gateway's public identity.
    pub fn public_key(&self) -> PublicKey {
        self.keys.public()
    }

    /// Run until a fatal error. Performs connection warm-up, announces the
    /// identity, then consumes the subscription while the maintenance
    /// timers tick.
    pub async fn run(self: Arc<Self>) -> Result<(), PipelineError> {
        self.warm_up().await?;
        self.announce_identity().await;

        let subscription = {
            let me = Arc::clone(&self);
            async move { me.subscription_loop().await }
        };

        tokio::select! {
            res = subscription => res,
            _ = self.wrap_compaction_loop() => unreachable!("compaction loop never returns"),
            _ = self.request_compaction_loop() => unreachable!("compaction loop never returns"),
            _ = self.reassembly_sweep_loop() => unreachable!("sweep loop never returns"),
        }
    }

    /// Open every configured relay and give the pool a moment to connect:
    /// 1 s, then a further 5 s grace before giving up for good.
    async fn warm_up(&self) -> Result<(), PipelineError> {
        for url in &self.config.relays {
            if let Err(err) = self.pool.ensure_relay(url).await {
                warn!(relay = %url, error = %err, "relay setup failed");
            }
        }

        sleep(Duration::from_secs(1)).await;
        if self.connected_relays().await.is_empty() {
            info!("no relay connected yet, waiting");
            sleep(Duration::from_secs(5)).await;
            if self.connected_relays().await.is_empty() {
                return Err(PipelineError::NoRelayConnected);
            }
        }
        Ok(())
    }

    async fn connected_relays(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for url in &self.config.relays {
            if self.pool.is_connected(url).await {
                connected.push(url.clone());
            }
        }
        connected
    }

    /// Compute and log the nprofile over the connected safe relays.
    async fn announce_identity(&self) {
        let hints: Vec<String> = self
            .connected_relays()
            .await
            .into_iter()
            .filter(|u| is_safe_relay_url(u))
            .take(self.config.nprofile_max_relays)
            .collect();

        match nprofile::encode(&self.keys.public(), &hints) {
            Ok(np) => {
                info!(nprofile = %np, pubkey = %self.keys.public_hex(), "gateway identity ready");
                let _ = self.nprofile.set(np);
            }
            Err(err) => warn!(error = %err, "nprofile encoding failed"),
        }
    }

    fn current_filter(&self) -> SubscriptionFilter {
        SubscriptionFilter::gift_wraps_for(self.keys.public_hex(), now_unix() - LOOKBACK)
    }

    fn already_have_callback(&self) -> AlreadyHave {
        let seen = Arc::clone(&self.wrap_seen);
        Arc::new(move |id: &str| seen.lock().unwrap().contains(id))
    }

    /// Consume events, rebuilding the subscription hourly with a fresh
    /// `since`. The old subscription closes only after the replacement is
    /// installed, so no delivery gap opens.
    async fn subscription_loop(self: Arc<Self>) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::channel::<Event>(256);
        let already_have = self.already_have_callback();

        let mut current = self
            .pool
            .subscribe(
                &self.config.relays,
                self.current_filter(),
                Arc::clone(&already_have),
                tx.clone(),
            )
            .await?;

        let mut rebuild = interval(RESUBSCRIBE_INTERVAL);
        rebuild.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rebuild.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                delivery = rx.recv() => {
                    let Some(event) = delivery else {
                        return Err(PipelineError::ChannelClosed);
                    };
                    let me = Arc::clone(&self);
                    tokio::spawn(async move { me.process_delivery(event).await });
                }
                _ = rebuild.tick() => {
                    match self
                        .pool
                        .subscribe(
                            &self.config.relays,
                            self.current_filter(),
                            Arc::clone(&already_have),
                            tx.clone(),
                        )
                        .await
                    {
                        Ok(next) => {
                            let old = std::mem::replace(&mut current, next);
                            old.close().await;
                            debug!("subscription rebuilt");
                        }
                        Err(err) => warn!(error = %err, "subscription rebuild failed"),
                    }
                }
            }
        }
    }

    /// Per-event entry point: all failures are logged with the wrap id and
    /// contained here.
    async fn process_delivery(&self, event: Event) {
        let wrap_id = event.id.clone();
        match self.handle_event(event).await {
            Ok(responded) => {
                if responded {
                    debug!(wrap_id = %wrap_id, "request handled");
                }
            }
            Err(reason) => debug!(wrap_id = %wrap_id, reason = %reason, "event dropped"),
        }
    }

    /// Drive one delivered wrap event through the pipeline. Returns
    /// `Ok(true)` when a response sequence was published, `Ok(false)` when
    /// the event was a part of a still-incomplete request.
    pub async fn handle_event(&self, event: Event) -> Result<bool, DropReason> {
        // Dedup on the wrap id before any crypto work.
        if self
            .wrap_seen
            .lock()
            .unwrap()
            .check_and_insert(&event.id, event.created_at)
        {
            return Err(DropReason::DuplicateWrap);
        }

        let sealed = unwrap_gift(&self.keys, &event)?;
        let (inner, requester_kex) = open_seal(&self.keys, &sealed)?;

        if inner.kind != KIND_HTTP_REQUEST {
            return Err(DropReason::NotARequest(inner.kind));
        }

        let oldest = self.oldest_time.load(Ordering::Relaxed);
        let max_future = now_unix() + MAX_FUTURE_SKEW;
        if inner.created_at < oldest || inner.created_at > max_future {
            return Err(DropReason::OutOfWindow {
                created_at: inner.created_at,
                oldest,
                max_future: MAX_FUTURE_SKEW,
            });
        }

        if self
            .request_seen
            .lock()
            .unwrap()
            .check_and_insert(&inner.id, inner.created_at)
        {
            return Err(DropReason::Replay);
        }

        let message: RequestMessage = serde_json::from_str(&inner.content)
            .map_err(|e| DropReason::Malformed(format!("request message: {e}")))?;
        message
            .validate()
            .map_err(|e| DropReason::Malformed(e.to_string()))?;

        let completed = self
            .reassembly
            .lock()
            .unwrap()
            .offer(message, Instant::now());
        let Some(parts) = completed else {
            return Ok(false);
        };

        let request = assemble(parts).map_err(|e| DropReason::Malformed(e.to_string()))?;
        // The response seals back to the key agreement key the seal layer
        // exposed for this requester.
        let requester = PublicKey::from_hex_parts(&inner.pubkey, &requester_kex)
            .map_err(|e| DropReason::Malformed(e.to_string()))?;

        info!(
            request_id = %request.id,
            method = %request.method,
            url = %request.url,
            "request complete"
        );
        self.respond(&requester, request).await;
        Ok(true)
    }

    /// Gate, dispatch, transform, chunk, publish.
    async fn respond(&self, requester: &PublicKey, request: CompleteRequest) {
        let response = if self.gate.allows(&request.url) {
            self.origin
                .fetch(OriginRequest {
                    url: request.url.clone(),
                    method: request.method.clone(),
                    headers: request.headers.clone(),
                    body: request.body.clone(),
                })
                .await
        } else {
            info!(request_id = %request.id, url = %request.url, "route denied");
            OriginResponse::forbidden_route()
        };

        let response = self.apply_transformer(&request, response);
        let chunks = chunk_response(&request.id, &response);
        self.publisher.publish_response(requester, &chunks).await;
    }

    fn apply_transformer(
        &self,
        request: &CompleteRequest,
        response: OriginResponse,
    ) -> OriginResponse {
        let Some(transformer) = &self.transformer else {
            return response;
        };
        let ctx = TransformContext {
            keys: Arc::clone(&self.keys),
            destination: self.config.destination.clone(),
            nprofile: self.nprofile.get().cloned().unwrap_or_default(),
        };
        match transformer.transform(request, &response, &ctx) {
            Ok(Some(replacement)) => replacement,
            Ok(None) => response,
            Err(err) => {
                error!(request_id = %request.id, error = %err, "transformer fault, keeping original response");
                response
            }
        }
    }

    async fn wrap_compaction_loop(&self) {
        let mut tick = interval(WRAP_COMPACT_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            let cutoff = now_unix() - LOOKBACK;
            let mut seen = self.wrap_seen.lock().unwrap();
            let before = seen.len();
            seen.compact(cutoff);
            debug!(removed = before - seen.len(), "wrap dedup compacted");
        }
    }

    /// Advances the admission cursor and prunes the request dedup map to
    /// the same bound, so the map stays proportional to the window.
    async fn request_compaction_loop(&self) {
        let mut tick = interval(REQUEST_COMPACT_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            let cursor = now_unix() - CURSOR_LAG;
            self.oldest_time.store(cursor, Ordering::Relaxed);
            let mut seen = self.request_seen.lock().unwrap();
            let before = seen.len();
            seen.compact(cursor);
            debug!(cursor, removed = before - seen.len(), "request dedup compacted");
        }
    }

    async fn reassembly_sweep_loop(&self) {
        let mut tick = interval(REASSEMBLY_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            self.reassembly.lock().unwrap().sweep(Instant::now());
        }
    }
}
