use super::presence::Presence;
use super::signal::SignalTarget;
use crate::calls::state::CallStateName;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The duplex session came up and authenticated.
#[derive(Debug, Clone)]
pub struct Connected {
    pub endpoint_id: String,
    pub connection_id: String,
}

/// The duplex session dropped. Reconnection may follow.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub reason: Option<String>,
}

/// The duplex session came back after one or more reconnect attempts.
#[derive(Debug, Clone)]
pub struct Reconnected {
    pub attempts: u32,
}

/// A text message addressed to this client.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub from_endpoint: String,
    pub from_connection: Option<String>,
    pub body: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A message published to a group this client belongs to.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub group_id: String,
    pub from_endpoint: String,
    pub from_connection: Option<String>,
    pub body: serde_json::Value,
}

/// Another connection joined or left a group this client observes.
#[derive(Debug, Clone)]
pub struct GroupMembership {
    pub group_id: String,
    pub endpoint_id: String,
    pub connection_id: String,
    pub joined: bool,
}

/// An observed endpoint's presence changed.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub endpoint_id: String,
    pub connection_id: String,
    pub presence: Presence,
    /// Presence of the endpoint after folding in all its connections.
    pub resolved: Presence,
}

/// A call entered or left a state; one event covers `<from>:exit` and
/// `<to>:entry`.
#[derive(Debug, Clone)]
pub struct CallStateChange {
    pub call_id: String,
    pub from: CallStateName,
    pub to: CallStateName,
    pub event: &'static str,
}

/// A well-formed signal was delivered to a call. `kind` is the wire
/// signal type, e.g. `offer` or `bye`.
#[derive(Debug, Clone)]
pub struct CallSignal {
    pub call_id: String,
    pub kind: &'static str,
    pub from_endpoint: String,
    pub from_connection: String,
}

/// A new inbound call was created from a remote offer. Look the call up on
/// the client by id to answer or reject it.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: String,
    pub remote_endpoint: String,
    pub target: SignalTarget,
}

/// Direct-connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum DirectConnectionEventKind {
    Start,
    Accept,
    Open,
    Close,
    Message(serde_json::Value),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct DirectConnectionEvent {
    pub session_id: String,
    pub remote_endpoint: String,
    pub kind: DirectConnectionEventKind,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus: one broadcast channel per event type, so
        /// consumers subscribe only to what they care about.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Client lifecycle
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),
    (reconnected, Arc<Reconnected>),

    // Messaging and membership
    (message, Arc<MessageReceived>),
    (group_message, Arc<GroupMessage>),
    (group_membership, Arc<GroupMembership>),
    (presence, Arc<PresenceUpdate>),

    // Calls
    (call_state, Arc<CallStateChange>),
    (call_signal, Arc<CallSignal>),
    (incoming_call, Arc<IncomingCall>),
    (direct_connection, Arc<DirectConnectionEvent>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Fire-and-forget send; a closed channel only means nobody is
    /// subscribed right now.
    pub(crate) fn emit<T>(sender: &broadcast::Sender<T>, value: T) {
        let _ = sender.send(value);
    }
}
