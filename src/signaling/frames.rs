//! Wire frames for the duplex session.
//!
//! Outbound RPCs carry the REST shape over the socket; inbound frames are
//! either the single response to an RPC or an unsolicited push.

use crate::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Client-side cap on the UTF-8 encoded request body. Requests over the
/// cap fail locally and no frame is emitted.
pub const BODY_SIZE_LIMIT: usize = 20_000;

/// One outbound RPC frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub id: u64,
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Every frame the server sends. Exactly one `response` arrives per
/// outbound RPC; everything else is a push.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Response {
        id: u64,
        status_code: u16,
        #[serde(default)]
        body: serde_json::Value,
    },
    /// A peer-to-peer signal; the body is the JSON-encoded signal.
    #[serde(rename_all = "camelCase")]
    Signal { body: String },
    #[serde(rename_all = "camelCase")]
    Pubsub {
        header: PushHeader,
        message: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Join {
        header: PushHeader,
        endpoint_id: String,
        connection_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        header: PushHeader,
        endpoint_id: String,
        connection_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        header: PushHeader,
        body: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Presence {
        header: PushHeader,
        presence: String,
        #[serde(default)]
        status: Option<String>,
    },
}

/// Origin metadata shared by all push kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushHeader {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_connection: Option<String>,
}

/// Substitute `{name}` placeholders in a path template.
///
/// Placeholders with no matching parameter are left intact so the server
/// rejects the malformed path instead of the client guessing.
pub fn fill_path(template: &str, params: &HashMap<&str, String>) -> String {
    let mut path = template.to_string();
    for (name, value) in params {
        path = path.replace(&format!("{{{name}}}"), value);
    }
    path
}

/// Serialize body parameters into a query string for GET/DELETE.
///
/// Scalars become `k=v`, arrays join with commas into `k=v1,v2`; objects
/// and nulls are skipped.
pub fn append_query(path: &str, params: &serde_json::Value) -> String {
    let Some(map) = params.as_object() else {
        return path.to_string();
    };

    let mut pairs = Vec::new();
    for (key, value) in map {
        let rendered = match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Array(items) => {
                let joined: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        serde_json::Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect();
                Some(joined.join(","))
            }
            _ => None,
        };
        if let Some(rendered) = rendered {
            pairs.push(format!("{key}={rendered}"));
        }
    }

    if pairs.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", pairs.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fill_path_substitutes_placeholders() {
        let mut params = HashMap::new();
        params.insert("id", "room-1".to_string());
        params.insert("endpointId", "alice".to_string());
        assert_eq!(
            fill_path("/v1/conferences/{id}/participants/{endpointId}", &params),
            "/v1/conferences/room-1/participants/alice"
        );
    }

    #[test]
    fn test_fill_path_leaves_unknown_placeholders() {
        let params = HashMap::new();
        assert_eq!(fill_path("/v1/channels/{id}/", &params), "/v1/channels/{id}/");
    }

    #[test]
    fn test_query_arrays_join_with_commas() {
        let q = append_query(
            "/v1/groups",
            &json!({"groups": ["a", "b", "c"], "limit": 50}),
        );
        // Key order in a serde_json map is insertion order.
        assert_eq!(q, "/v1/groups?groups=a,b,c&limit=50");
    }

    #[test]
    fn test_query_skips_objects_and_nulls() {
        let q = append_query("/v1/turn", &json!({"nested": {"x": 1}, "skip": null, "ok": "yes"}));
        assert_eq!(q, "/v1/turn?ok=yes");
    }

    #[test]
    fn test_inbound_response_frame_parses() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"type":"response","id":7,"statusCode":200,"body":{"token":"t"}}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Response {
                id, status_code, ..
            } => {
                assert_eq!(id, 7);
                assert_eq!(status_code, 200);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_inbound_presence_frame_parses() {
        let frame: InboundFrame = serde_json::from_value(json!({
            "type": "presence",
            "header": {"from": "bob", "fromConnection": "c9"},
            "presence": "away",
            "status": "brb",
        }))
        .unwrap();
        match frame {
            InboundFrame::Presence {
                header, presence, ..
            } => {
                assert_eq!(header.from.as_deref(), Some("bob"));
                assert_eq!(presence, "away");
            }
            other => panic!("expected presence, got {other:?}"),
        }
    }
}
