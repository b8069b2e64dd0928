//! Reassembly of multi-part requests arriving out of order.
//!
//! Parts for a request id accumulate in a map keyed by part index
//! (last-write-wins on duplicates); the request completes when the number
//! of distinct indices reaches the declared part count. Entries that never
//! complete expire 60 s after the first part and are dropped silently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;

use kh_proto::RequestMessage;

/// How long a partial request may wait for its remaining parts.
pub const REASSEMBLY_TTL: Duration = Duration::from_secs(60);

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("completed request has no index-0 part")]
    MissingFirstPart,
    #[error("first part is missing {0}")]
    MissingMeta(&'static str),
    #[error("part {index} body is not valid base64")]
    BadBody { index: u64 },
}

/// A fully reassembled request, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    parts: HashMap<u64, RequestMessage>,
    expires_at: Instant,
}

/// Buffer of partial requests keyed by request id.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    pending: HashMap<String, Pending>,
    ttl: Duration,
}

impl ReassemblyBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    /// Insert one part. When the distinct-index count reaches the part's
    /// declared `parts` value, the entry is removed and the parts are
    /// returned in ascending index order.
    pub fn offer(&mut self, part: RequestMessage, now: Instant) -> Option<Vec<RequestMessage>> {
        let id = part.id.clone();
        let declared = part.parts;

        let entry = self.pending.entry(id.clone()).or_insert_with(|| Pending {
            parts: HashMap::new(),
            expires_at: now + self.ttl,
        });
        entry.parts.insert(part.part_index, part);

        if (entry.parts.len() as u64) < declared {
            return None;
        }

        // The entry exists: we inserted into it above.
        let done = self.pending.remove(&id).unwrap();
        let mut parts: Vec<RequestMessage> = done.parts.into_values().collect();
        parts.sort_by_key(|p| p.part_index);
        Some(parts)
    }

    /// Drop entries whose timeout has passed.
    pub fn sweep(&mut self, now: Instant) {
        self.pending.retain(|_, p| p.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Concatenate completed parts into a [`CompleteRequest`].
///
/// Metadata comes from the index-0 part; its absence (possible when a
/// request completed through mislabeled indices) rejects the request.
pub fn assemble(parts: Vec<RequestMessage>) -> Result<CompleteRequest, AssembleError> {
    let first = match parts.first() {
        Some(p) if p.part_index == 0 => p,
        _ => return Err(AssembleError::MissingFirstPart),
    };

    let id = first.id.clone();
    let url = first.url.clone().ok_or(AssembleError::MissingMeta("url"))?;
    let method = first
        .method
        .clone()
        .ok_or(AssembleError::MissingMeta("method"))?;
    let headers = first
        .headers
        .clone()
        .ok_or(AssembleError::MissingMeta("headers"))?;

    let mut body = Vec::new();
    for part in &parts {
        let chunk = B64
            .decode(&part.body_base64)
            .map_err(|_| AssembleError::BadBody {
                index: part.part_index,
            })?;
        body.extend_from_slice(&chunk);
    }

    Ok(CompleteRequest {
        id,
        url,
        method,
        headers,
        body,
    })
}
