//! The keyhole event pipeline.
//!
//! Wire model and crypto live in `kh-proto` / `kh-crypto`; this crate turns
//! a stream of delivered gift-wrap events into origin HTTP calls and
//! published response sequences. The [`pipeline::Pipeline`] orchestrator
//! owns the flow; the relay transport and origin HTTP client are injected
//! behind the [`relays::RelayPool`] and [`origin::OriginClient`] traits.

#![forbid(unsafe_code)]

pub mod chunker;
pub mod dedup;
pub mod errors;
pub mod origin;
pub mod pipeline;
pub mod publish;
pub mod reassembly;
pub mod relays;
pub mod routes;
pub mod transform;

pub use errors::{DropReason, PipelineError, PoolError, PublishError};
pub use origin::{HttpOriginClient, OriginClient, OriginRequest, OriginResponse};
pub use pipeline::{Pipeline, PipelineConfig};
pub use relays::{AlreadyHave, RelayPool, Subscription};
pub use routes::RouteGate;
pub use transform::{ResponseTransformer, TransformContext, TransformError};

/// Seconds since the Unix epoch.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
