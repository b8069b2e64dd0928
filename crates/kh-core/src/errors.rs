//! Error types for the pipeline and its collaborators.
//!
//! Inbound failures are all [`DropReason`]s: the event is logged and
//! dropped, never answered. Route denials and origin failures are not
//! errors at all; they synthesize responses upstream.

use kh_proto::wrap::UnwrapError;

use crate::routes::RouteError;

/// Why a delivered event was dropped without a response.
#[derive(Debug, thiserror::Error)]
pub enum DropReason {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error(transparent)]
    Unwrap(#[from] UnwrapError),
    #[error("inner event kind {0} is not an http request")]
    NotARequest(u32),
    #[error("created_at {created_at} outside accepted window [{oldest}, now+{max_future}]")]
    OutOfWindow {
        created_at: i64,
        oldest: i64,
        max_future: i64,
    },
    #[error("duplicate wrap event")]
    DuplicateWrap,
    #[error("request id already handled")]
    Replay,
}

/// Per-relay publish failures. Isolated per relay: one failing relay never
/// aborts the others.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("relay not connected")]
    NotConnected,
    #[error("relay rejected event: {0}")]
    Rejected(String),
    #[error("publish not acknowledged in time")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Relay pool failures.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid relay url {0:?}")]
    BadUrl(String),
    #[error("relay pool is closed")]
    Closed,
}

/// Fatal pipeline errors. Everything here ends the run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no relay connected after warm-up")]
    NoRelayConnected,
    #[error(transparent)]
    Routes(#[from] RouteError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("event delivery channel closed")]
    ChannelClosed,
}
