//! Signal type definitions.
//!
//! Signals are the peer-to-peer half of the wire protocol: opaque session
//! descriptions, ICE candidates, and call-control verbs relayed by the
//! service between endpoints. Every signal correlates to a call through its
//! `sessionId`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// What kind of session a signal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalTarget {
    /// Audio/video call.
    Call,
    /// Screen-share session.
    Screenshare,
    /// Peer-to-peer data channel.
    DirectConnection,
}

impl SignalTarget {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Screenshare => "screenshare",
            Self::DirectConnection => "directConnection",
        }
    }
}

impl fmt::Display for SignalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renegotiation verb carried by a `modify` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModifyAction {
    Initiate,
    Accept,
    Reject,
}

impl ModifyAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

/// An opaque session description as produced by the peer-connection
/// primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// An opaque ICE candidate. The core relays these without interpreting them.
pub type IceCandidate = serde_json::Value;

/// Per-type payload of a signal. Each arm carries only its own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signalType", rename_all = "camelCase")]
pub enum SignalPayload {
    #[serde(rename_all = "camelCase")]
    Offer { session_description: SessionDescription },
    #[serde(rename_all = "camelCase")]
    Answer { session_description: SessionDescription },
    Connected,
    #[serde(rename_all = "camelCase")]
    IceCandidates { ice_candidates: Vec<IceCandidate> },
    #[serde(rename_all = "camelCase")]
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Modify { action: ModifyAction },
    /// Transport-level acknowledgement, distinct from application state.
    /// Dropped on receive, never emitted.
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<String>,
    },
}

impl SignalPayload {
    /// Wire name of the signal type.
    pub const fn signal_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Connected => "connected",
            Self::IceCandidates { .. } => "iceCandidates",
            Self::Bye { .. } => "bye",
            Self::Modify { .. } => "modify",
            Self::Ack { .. } => "ack",
        }
    }
}

/// One signal as carried on the wire, envelope plus typed payload.
///
/// A signal is ephemeral: constructed, routed to its call, discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub signal_id: String,
    /// Session this signal belongs to; correlates with the call id.
    pub session_id: String,
    pub target: Option<SignalTarget>,
    pub from_endpoint: String,
    pub from_connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<CallerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Display information a caller may attach to an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

/// Generate a fresh signal id: hash of random bytes and the wall clock,
/// truncated to 32 hex chars.
pub fn generate_signal_id() -> String {
    use rand::RngCore;

    let mut data = Vec::with_capacity(8 + 16);
    let now = chrono::Utc::now().timestamp_millis();
    data.extend_from_slice(&now.to_be_bytes());
    let mut random_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    data.extend_from_slice(&random_bytes);

    let hash = Sha256::digest(&data);
    hex::encode(&hash[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_ids_are_unique_and_nonempty() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let id = generate_signal_id();
            assert!(!id.is_empty());
            assert!(seen.insert(id), "duplicate signal id generated");
        }
    }

    #[test]
    fn test_payload_roundtrip_keeps_tag() {
        let msg = SignalingMessage {
            signal_id: generate_signal_id(),
            session_id: "session-1".into(),
            target: Some(SignalTarget::Call),
            from_endpoint: "alice".into(),
            from_connection: "conn-a".into(),
            to_original: None,
            caller_id: None,
            metadata: None,
            payload: SignalPayload::Offer {
                session_description: SessionDescription::offer("v=0"),
            },
        };

        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["signalType"], "offer");
        assert_eq!(wire["target"], "call");
        assert_eq!(wire["sessionDescription"]["type"], "offer");

        let back: SignalingMessage = serde_json::from_value(wire).unwrap();
        assert!(matches!(back.payload, SignalPayload::Offer { .. }));
    }

    #[test]
    fn test_unknown_signal_type_fails_to_parse() {
        let wire = serde_json::json!({
            "signalId": "s1",
            "sessionId": "x",
            "target": "call",
            "fromEndpoint": "alice",
            "fromConnection": "conn-a",
            "signalType": "shrug",
        });
        assert!(serde_json::from_value::<SignalingMessage>(wire).is_err());
    }

    #[test]
    fn test_bye_arm_carries_only_reason() {
        let wire = serde_json::json!({
            "signalId": "s2",
            "sessionId": "x",
            "target": "call",
            "fromEndpoint": "alice",
            "fromConnection": "conn-a",
            "signalType": "bye",
            "reason": "busy",
        });
        let msg: SignalingMessage = serde_json::from_value(wire).unwrap();
        match msg.payload {
            SignalPayload::Bye { reason } => assert_eq!(reason.as_deref(), Some("busy")),
            other => panic!("expected bye, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_target_parses_as_none() {
        let wire = serde_json::json!({
            "signalId": "s3",
            "sessionId": "x",
            "fromEndpoint": "alice",
            "fromConnection": "conn-a",
            "signalType": "connected",
        });
        let msg: SignalingMessage = serde_json::from_value(wire).unwrap();
        assert!(msg.target.is_none());
    }
}
