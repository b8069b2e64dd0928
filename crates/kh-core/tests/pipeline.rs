//! End-to-end pipeline tests over an in-memory relay pool and a scripted
//! origin client. Requests are produced with the same wrap builder a real
//! client uses, and published responses are decrypted back with the
//! requester's key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;

use kh_core::{
    now_unix, AlreadyHave, DropReason, OriginClient, OriginRequest, OriginResponse, Pipeline,
    PipelineConfig, PoolError, PublishError, RelayPool, ResponseTransformer, Subscription,
    TransformContext, TransformError,
};
use kh_crypto::{Keypair, PublicKey};
use kh_proto::wrap::{self, recipient_tags};
use kh_proto::{
    Event, RequestMessage, ResponseMessage, SubscriptionFilter, KIND_HTTP_REQUEST,
    KIND_HTTP_RESPONSE,
};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryPool {
    published: Mutex<Vec<(String, Event)>>,
}

struct NoopSubscription;

#[async_trait]
impl Subscription for NoopSubscription {
    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl RelayPool for MemoryPool {
    async fn ensure_relay(&self, _url: &str) -> Result<(), PoolError> {
        Ok(())
    }

    async fn is_connected(&self, _url: &str) -> bool {
        true
    }

    async fn subscribe(
        &self,
        _relays: &[String],
        _filter: SubscriptionFilter,
        _already_have: AlreadyHave,
        _events: mpsc::Sender<Event>,
    ) -> Result<Box<dyn Subscription>, PoolError> {
        Ok(Box::new(NoopSubscription))
    }

    async fn publish(&self, relay: &str, event: Event) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((relay.to_string(), event));
        Ok(())
    }

    async fn close(&self) {}
}

struct ScriptedOrigin {
    response: OriginResponse,
    calls: Mutex<Vec<OriginRequest>>,
}

impl ScriptedOrigin {
    fn returning(response: OriginResponse) -> Arc<Self> {
        Arc::new(Self {
            response,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl OriginClient for ScriptedOrigin {
    async fn fetch(&self, request: OriginRequest) -> OriginResponse {
        self.calls.lock().unwrap().push(request);
        self.response.clone()
    }
}

fn ok_response(body: &[u8]) -> OriginResponse {
    OriginResponse {
        status: 200,
        headers: HashMap::new(),
        body: body.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    gateway_pub: PublicKey,
    gateway_pub_hex: String,
    client: Keypair,
    pipeline: Pipeline,
    pool: Arc<MemoryPool>,
    origin: Arc<ScriptedOrigin>,
}

fn harness(routes: &[&str], response: OriginResponse) -> Harness {
    harness_with(routes, response, None)
}

fn harness_with(
    routes: &[&str],
    response: OriginResponse,
    transformer: Option<Arc<dyn ResponseTransformer>>,
) -> Harness {
    let gateway_keys = Keypair::generate();
    let gateway_pub = gateway_keys.public();
    let gateway_pub_hex = gateway_keys.public_hex();

    let pool = Arc::new(MemoryPool::default());
    let origin = ScriptedOrigin::returning(response);

    let config = PipelineConfig {
        destination: "http://origin.local".into(),
        relays: vec!["wss://relay.test".into()],
        allowed_routes: routes.iter().map(|s| s.to_string()).collect(),
        timeout: Duration::from_secs(5),
        nprofile_max_relays: 3,
    };

    let pipeline = Pipeline::new(
        gateway_keys,
        config,
        pool.clone() as Arc<dyn RelayPool>,
        origin.clone() as Arc<dyn OriginClient>,
        transformer,
    )
    .unwrap();

    Harness {
        gateway_pub,
        gateway_pub_hex,
        client: Keypair::generate(),
        pipeline,
        pool,
        origin,
    }
}

fn request_part(
    id: &str,
    part_index: u64,
    parts: u64,
    url: &str,
    body: &[u8],
) -> RequestMessage {
    RequestMessage {
        id: id.into(),
        part_index,
        parts,
        body_base64: B64.encode(body),
        url: (part_index == 0).then(|| url.to_string()),
        method: (part_index == 0).then(|| "GET".to_string()),
        headers: (part_index == 0).then(HashMap::new),
    }
}

impl Harness {
    fn request_event_at(&self, msg: &RequestMessage, created_at: i64) -> Event {
        wrap::wrap_payload(
            &self.client,
            &self.gateway_pub,
            KIND_HTTP_REQUEST,
            serde_json::to_string(msg).unwrap(),
            recipient_tags(&self.gateway_pub, &[]),
            created_at,
        )
        .unwrap()
    }

    fn request_event(&self, msg: &RequestMessage) -> Event {
        self.request_event_at(msg, now_unix())
    }

    fn origin_calls(&self) -> usize {
        self.origin.calls.lock().unwrap().len()
    }

    /// Decrypt every published wrap back into its response message.
    fn published_responses(&self) -> Vec<ResponseMessage> {
        let published = self.pool.published.lock().unwrap();
        published
            .iter()
            .map(|(_, event)| {
                assert_ne!(
                    event.pubkey, self.gateway_pub_hex,
                    "outgoing wrap must not use the gateway's long-lived key"
                );
                let sealed = wrap::unwrap_gift(&self.client, event).unwrap();
                assert_eq!(sealed.pubkey, self.gateway_pub_hex);
                let (inner, _gateway_kex) = wrap::open_seal(&self.client, &sealed).unwrap();
                assert_eq!(inner.kind, KIND_HTTP_RESPONSE);
                serde_json::from_str(&inner.content).unwrap()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_single_part() {
    let h = harness(&["/v1/**"], ok_response(b"ok"));
    let event = h.request_event(&request_part("r1", 0, 1, "/v1/x", b""));

    let responded = h.pipeline.handle_event(event).await.unwrap();
    assert!(responded);
    assert_eq!(h.origin_calls(), 1);

    let responses = h.published_responses();
    assert_eq!(responses.len(), 1);
    let first = &responses[0];
    assert_eq!(first.id, "r1");
    assert_eq!(first.status, Some(200));
    assert_eq!(first.parts, 1);
    assert_eq!(first.part_index, 0);
    assert_eq!(first.body_base64, B64.encode(b"ok"));
}

#[tokio::test]
async fn test_forbidden_route_skips_origin() {
    let h = harness(&["/v1/**"], ok_response(b"should not be seen"));
    let event = h.request_event(&request_part("r1", 0, 1, "/v2/y", b""));

    assert!(h.pipeline.handle_event(event).await.unwrap());
    assert_eq!(h.origin_calls(), 0, "origin must not be called");

    let responses = h.published_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, Some(403));
    assert_eq!(responses[0].body_base64, B64.encode(b"Forbidden route"));
}

#[tokio::test]
async fn test_large_response_chunks() {
    let h = harness(&[], ok_response(&vec![9u8; 40_000]));
    let event = h.request_event(&request_part("r1", 0, 1, "/big", b""));

    assert!(h.pipeline.handle_event(event).await.unwrap());

    let responses = h.published_responses();
    assert_eq!(responses.len(), 3);
    let lens: Vec<usize> = responses
        .iter()
        .map(|r| B64.decode(&r.body_base64).unwrap().len())
        .collect();
    assert_eq!(lens, vec![16_384, 16_384, 7_232]);

    for (i, r) in responses.iter().enumerate() {
        assert_eq!(r.id, "r1");
        assert_eq!(r.parts, 3);
        assert_eq!(r.part_index, i as u64);
        assert_eq!(r.status.is_some(), i == 0);
        assert_eq!(r.headers.is_some(), i == 0);
    }
}

#[tokio::test]
async fn test_multi_part_request_reassembles() {
    let h = harness(&[], ok_response(b"done"));
    let now = now_unix();

    // Three parts, delivered out of order, each in its own envelope.
    let p2 = h.request_event_at(&request_part("r1", 2, 3, "/u", b"!"), now);
    let p0 = h.request_event_at(&request_part("r1", 0, 3, "/u", b"hel"), now);
    let p1 = h.request_event_at(&request_part("r1", 1, 3, "/u", b"lo"), now);

    assert!(!h.pipeline.handle_event(p2).await.unwrap());
    assert!(!h.pipeline.handle_event(p0).await.unwrap());
    assert!(h.pipeline.handle_event(p1).await.unwrap());

    assert_eq!(h.origin_calls(), 1);
    let calls = h.origin.calls.lock().unwrap();
    assert_eq!(calls[0].body, b"hello!");
    assert_eq!(calls[0].url, "/u");
}

#[tokio::test]
async fn test_replayed_inner_event_is_dropped() {
    let h = harness(&[], ok_response(b"once"));
    let now = now_unix();
    let msg = request_part("r1", 0, 1, "/x", b"");

    // Two distinct wraps around byte-identical inner events.
    let first = h.request_event_at(&msg, now);
    let second = h.request_event_at(&msg, now);
    assert_ne!(first.id, second.id);

    assert!(h.pipeline.handle_event(first).await.unwrap());
    let err = h.pipeline.handle_event(second).await.unwrap_err();
    assert!(matches!(err, DropReason::Replay));

    assert_eq!(h.origin_calls(), 1);
    assert_eq!(h.published_responses().len(), 1);
}

#[tokio::test]
async fn test_duplicate_wrap_is_dropped_before_crypto() {
    let h = harness(&[], ok_response(b"once"));
    let event = h.request_event(&request_part("r1", 0, 1, "/x", b""));

    assert!(h.pipeline.handle_event(event.clone()).await.unwrap());
    let err = h.pipeline.handle_event(event).await.unwrap_err();
    assert!(matches!(err, DropReason::DuplicateWrap));
    assert_eq!(h.origin_calls(), 1);
}

#[tokio::test]
async fn test_stale_inner_event_is_dropped() {
    let h = harness(&[], ok_response(b"never"));
    let event =
        h.request_event_at(&request_part("r1", 0, 1, "/x", b""), now_unix() - 3_600);

    let err = h.pipeline.handle_event(event).await.unwrap_err();
    assert!(matches!(err, DropReason::OutOfWindow { .. }));
    assert_eq!(h.origin_calls(), 0);
    assert!(h.published_responses().is_empty());
}

#[tokio::test]
async fn test_far_future_inner_event_is_dropped() {
    let h = harness(&[], ok_response(b"never"));
    let event =
        h.request_event_at(&request_part("r1", 0, 1, "/x", b""), now_unix() + 1_200);

    let err = h.pipeline.handle_event(event).await.unwrap_err();
    assert!(matches!(err, DropReason::OutOfWindow { .. }));
    assert!(h.published_responses().is_empty());
}

struct OverrideTransformer;

impl ResponseTransformer for OverrideTransformer {
    fn transform(
        &self,
        _request: &kh_core::reassembly::CompleteRequest,
        _response: &OriginResponse,
        _ctx: &TransformContext,
    ) -> Result<Option<OriginResponse>, TransformError> {
        Ok(Some(OriginResponse {
            status: 299,
            headers: HashMap::from([("x-y".to_string(), "z".to_string())]),
            body: b"BYE".to_vec(),
        }))
    }
}

#[tokio::test]
async fn test_transformer_override_replaces_response() {
    let h = harness_with(&[], ok_response(b"original"), Some(Arc::new(OverrideTransformer)));
    let event = h.request_event(&request_part("r1", 0, 1, "/x", b""));

    assert!(h.pipeline.handle_event(event).await.unwrap());

    let responses = h.published_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, Some(299));
    assert_eq!(
        responses[0].headers.as_ref().unwrap().get("x-y").unwrap(),
        "z"
    );
    assert_eq!(responses[0].body_base64, B64.encode(b"BYE"));
}

struct FaultyTransformer;

impl ResponseTransformer for FaultyTransformer {
    fn transform(
        &self,
        _request: &kh_core::reassembly::CompleteRequest,
        _response: &OriginResponse,
        _ctx: &TransformContext,
    ) -> Result<Option<OriginResponse>, TransformError> {
        Err(TransformError("deliberate fault".into()))
    }
}

#[tokio::test]
async fn test_transformer_fault_keeps_original_response() {
    let h = harness_with(&[], ok_response(b"original"), Some(Arc::new(FaultyTransformer)));
    let event = h.request_event(&request_part("r1", 0, 1, "/x", b""));

    assert!(h.pipeline.handle_event(event).await.unwrap());

    let responses = h.published_responses();
    assert_eq!(responses[0].status, Some(200));
    assert_eq!(responses[0].body_base64, B64.encode(b"original"));
}

#[tokio::test]
async fn test_tampered_seal_is_dropped() {
    let h = harness(&[], ok_response(b"never"));
    let now = now_unix();

    let msg = request_part("r1", 0, 1, "/x", b"");
    let inner = kh_proto::UnsignedEvent::build(
        h.client.public_hex(),
        KIND_HTTP_REQUEST,
        vec![],
        serde_json::to_string(&msg).unwrap(),
        now,
    );
    let mut sealed = wrap::seal(&h.client, &h.gateway_pub, &inner, now).unwrap();
    let mut sig = sealed.sig.into_bytes();
    sig[0] = if sig[0] == b'0' { b'1' } else { b'0' };
    sealed.sig = String::from_utf8(sig).unwrap();
    let event = wrap::gift_wrap(&h.gateway_pub, &sealed, vec![], now).unwrap();

    let err = h.pipeline.handle_event(event).await.unwrap_err();
    assert!(matches!(err, DropReason::Unwrap(_)));
    assert!(h.published_responses().is_empty());
}

#[tokio::test]
async fn test_empty_origin_body_yields_one_empty_part() {
    let h = harness(&[], ok_response(b""));
    let event = h.request_event(&request_part("r1", 0, 1, "/x", b""));

    assert!(h.pipeline.handle_event(event).await.unwrap());

    let responses = h.published_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].parts, 1);
    assert_eq!(responses[0].body_base64, "");
    assert_eq!(responses[0].status, Some(200));
}

#[tokio::test]
async fn test_wrong_inner_kind_is_dropped() {
    let h = harness(&[], ok_response(b"never"));
    let event = wrap::wrap_payload(
        &h.client,
        &h.gateway_pub,
        KIND_HTTP_RESPONSE, // a response kind where a request is expected
        serde_json::to_string(&request_part("r1", 0, 1, "/x", b"")).unwrap(),
        vec![],
        now_unix(),
    )
    .unwrap();

    let err = h.pipeline.handle_event(event).await.unwrap_err();
    assert!(matches!(err, DropReason::NotARequest(_)));
}

#[tokio::test]
async fn test_garbage_request_message_is_dropped() {
    let h = harness(&[], ok_response(b"never"));
    let event = wrap::wrap_payload(
        &h.client,
        &h.gateway_pub,
        KIND_HTTP_REQUEST,
        "this is not json".into(),
        vec![],
        now_unix(),
    )
    .unwrap();

    let err = h.pipeline.handle_event(event).await.unwrap_err();
    assert!(matches!(err, DropReason::Malformed(_)));
    assert!(h.published_responses().is_empty());
}
