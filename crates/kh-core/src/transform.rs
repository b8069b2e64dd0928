//! Optional in-process response transformation.
//!
//! Library consumers may rewrite the origin's answer before it is chunked
//! and published. The transformer is trusted code running in-process; its
//! only fault channel is an explicit error, which keeps the original
//! response.

use std::sync::Arc;

use kh_crypto::Keypair;

use crate::origin::OriginResponse;
use crate::reassembly::CompleteRequest;

/// Ambient data handed to the transformer alongside each exchange.
pub struct TransformContext {
    /// The gateway's long-lived keypair.
    pub keys: Arc<Keypair>,
    /// The configured origin URL prefix.
    pub destination: String,
    /// The gateway's published nprofile, when already computed.
    pub nprofile: String,
}

#[derive(Debug, thiserror::Error)]
#[error("transformer fault: {0}")]
pub struct TransformError(pub String);

/// Rewrites responses before publication.
pub trait ResponseTransformer: Send + Sync {
    /// Return `Ok(Some(..))` to replace the response, `Ok(None)` to keep
    /// the original. An `Err` is logged and the original response is used.
    fn transform(
        &self,
        request: &CompleteRequest,
        response: &OriginResponse,
        ctx: &TransformContext,
    ) -> Result<Option<OriginResponse>, TransformError>;
}
