//! Splitting a response body into size-bounded part messages.

use base64::Engine;

use kh_proto::ResponseMessage;

use crate::origin::OriginResponse;

/// Maximum pre-base64 body bytes per part. Sized so that the encoded part
/// plus its envelope overhead stays well under the encryption ceiling.
pub const PART_BODY_MAX: usize = 16_384;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Chunk `response` into a part sequence for request `id`.
///
/// An empty body still yields one (empty) part. Status and headers ride on
/// the index-0 part only; every part carries the id and total count.
pub fn chunk_response(id: &str, response: &OriginResponse) -> Vec<ResponseMessage> {
    let slices: Vec<&[u8]> = if response.body.is_empty() {
        vec![&[]]
    } else {
        response.body.chunks(PART_BODY_MAX).collect()
    };

    let parts = slices.len() as u64;
    slices
        .into_iter()
        .enumerate()
        .map(|(index, slice)| ResponseMessage {
            id: id.to_string(),
            part_index: index as u64,
            parts,
            body_base64: B64.encode(slice),
            status: (index == 0).then_some(response.status),
            headers: (index == 0).then(|| response.headers.clone()),
        })
        .collect()
}
