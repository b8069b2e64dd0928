//! Part messages carried inside inner events.
//!
//! A request or response larger than one event is split into parts sharing
//! an `id`; only the part at `partIndex == 0` carries the metadata (url,
//! method, headers on requests; status, headers on responses).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maximum accepted length of a part message id.
pub const MAX_MESSAGE_ID_LEN: usize = 100;

/// Largest integer the wire format treats as exact.
const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Validation failures for part messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message id is empty")]
    EmptyId,
    #[error("message id exceeds {MAX_MESSAGE_ID_LEN} chars")]
    IdTooLong,
    #[error("partIndex is out of range")]
    BadPartIndex,
    #[error("parts must be a positive integer")]
    BadParts,
    #[error("first part is missing {0}")]
    MissingMeta(&'static str),
}

/// One part of a relayed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub id: String,
    pub part_index: u64,
    pub parts: u64,
    pub body_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// One part of a relayed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub id: String,
    pub part_index: u64,
    pub parts: u64,
    pub body_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

fn validate_common(id: &str, part_index: u64, parts: u64) -> Result<(), MessageError> {
    if id.is_empty() {
        return Err(MessageError::EmptyId);
    }
    if id.chars().count() > MAX_MESSAGE_ID_LEN {
        return Err(MessageError::IdTooLong);
    }
    if part_index > MAX_SAFE_INTEGER {
        return Err(MessageError::BadPartIndex);
    }
    if parts == 0 || parts > MAX_SAFE_INTEGER {
        return Err(MessageError::BadParts);
    }
    Ok(())
}

impl RequestMessage {
    /// Validate the fields the pipeline requires before a part is admitted.
    ///
    /// Parts past index 0 may carry metadata fields; they are accepted and
    /// ignored. The index-0 part must carry all of them.
    pub fn validate(&self) -> Result<(), MessageError> {
        validate_common(&self.id, self.part_index, self.parts)?;
        if self.part_index == 0 {
            if self.url.is_none() {
                return Err(MessageError::MissingMeta("url"));
            }
            if self.method.is_none() {
                return Err(MessageError::MissingMeta("method"));
            }
            if self.headers.is_none() {
                return Err(MessageError::MissingMeta("headers"));
            }
        }
        Ok(())
    }
}

impl ResponseMessage {
    pub fn validate(&self) -> Result<(), MessageError> {
        validate_common(&self.id, self.part_index, self.parts)?;
        if self.part_index == 0 && self.status.is_none() {
            return Err(MessageError::MissingMeta("status"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_part() -> RequestMessage {
        RequestMessage {
            id: "r1".into(),
            part_index: 0,
            parts: 1,
            body_base64: String::new(),
            url: Some("/v1/x".into()),
            method: Some("GET".into()),
            headers: Some(HashMap::new()),
        }
    }

    #[test]
    fn test_valid_first_part() {
        assert!(first_part().validate().is_ok());
    }

    #[test]
    fn test_later_part_needs_no_meta() {
        let msg = RequestMessage {
            id: "r1".into(),
            part_index: 1,
            parts: 3,
            body_base64: "aGk=".into(),
            url: None,
            method: None,
            headers: None,
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_first_part_requires_meta() {
        let mut msg = first_part();
        msg.url = None;
        assert_eq!(msg.validate(), Err(MessageError::MissingMeta("url")));

        let mut msg = first_part();
        msg.method = None;
        assert_eq!(msg.validate(), Err(MessageError::MissingMeta("method")));

        let mut msg = first_part();
        msg.headers = None;
        assert_eq!(msg.validate(), Err(MessageError::MissingMeta("headers")));
    }

    #[test]
    fn test_id_bounds() {
        let mut msg = first_part();
        msg.id = String::new();
        assert_eq!(msg.validate(), Err(MessageError::EmptyId));

        let mut msg = first_part();
        msg.id = "x".repeat(101);
        assert_eq!(msg.validate(), Err(MessageError::IdTooLong));

        let mut msg = first_part();
        msg.id = "x".repeat(100);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_parts_must_be_positive() {
        let mut msg = first_part();
        msg.parts = 0;
        assert_eq!(msg.validate(), Err(MessageError::BadParts));
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let json = serde_json::to_string(&first_part()).unwrap();
        assert!(json.contains("\"partIndex\":0"));
        assert!(json.contains("\"bodyBase64\""));
        assert!(!json.contains("part_index"));
    }

    #[test]
    fn test_response_first_part_requires_status() {
        let msg = ResponseMessage {
            id: "r1".into(),
            part_index: 0,
            parts: 1,
            body_base64: String::new(),
            status: None,
            headers: None,
        };
        assert_eq!(msg.validate(), Err(MessageError::MissingMeta("status")));
    }

    #[test]
    fn test_extra_meta_on_later_parts_is_tolerated() {
        let json = r#"{"id":"r1","partIndex":2,"parts":3,"bodyBase64":"","url":"/ignored","method":"GET","headers":{}}"#;
        let msg: RequestMessage = serde_json::from_str(json).unwrap();
        assert!(msg.validate().is_ok());
        assert_eq!(msg.url.as_deref(), Some("/ignored"));
    }
}
