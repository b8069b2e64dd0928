//! Relay subscription filters.

use serde::{Deserialize, Serialize};

use crate::event::KIND_GIFT_WRAP;

/// The filter sent with a `REQ` frame. Only the fields the gateway uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub since: i64,
    pub kinds: Vec<u32>,
    #[serde(rename = "#p")]
    pub p_tags: Vec<String>,
}

impl SubscriptionFilter {
    /// Filter for gift-wraps addressed to `pubkey_hex`, newer than `since`.
    pub fn gift_wraps_for(pubkey_hex: String, since: i64) -> Self {
        Self {
            since,
            kinds: vec![KIND_GIFT_WRAP],
            p_tags: vec![pubkey_hex],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let f = SubscriptionFilter::gift_wraps_for("ab".into(), 1_700_000_000);
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(
            json,
            r##"{"since":1700000000,"kinds":[21059],"#p":["ab"]}"##
        );
    }
}
