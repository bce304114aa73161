//! Inbound signal routing.
//!
//! Dispatch is an explicit table keyed by the signal-type sum type: each
//! recognised kind fans out to the matching call handler. Ordering within
//! one session follows server delivery order; the routing layer never
//! reorders.

use super::SignalingChannel;
use super::frames::InboundFrame;
use crate::calls::Call;
use crate::types::events::{EventBus, GroupMembership, GroupMessage, MessageReceived};
use crate::types::presence::Presence;
use crate::types::signal::{SignalPayload, SignalTarget, SignalingMessage};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while routing one inbound signal. Routing errors are
/// logged by the channel; they never tear the session down.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("signal is missing its target")]
    MissingTarget,
    #[error("signal body is not valid JSON: {0}")]
    Malformed(String),
    /// The session resolved to a call whose id does not match.
    #[error("orphan signal for session {session_id}")]
    Orphan { session_id: String },
    #[error("no delegate installed to create calls")]
    NoDelegate,
}

/// Hooks the owning client provides to the channel.
///
/// The channel never owns calls or endpoints; everything it needs from the
/// client side comes through here, and only through a weak handle.
#[async_trait]
pub trait SignalingDelegate: Send + Sync {
    /// Whether an incoming-call listener is registered. Calls started
    /// while nobody listens terminate immediately.
    fn is_listening_for_calls(&self) -> bool;

    /// Resolve a call for a signal, creating one when `create` is set.
    /// For `directConnection` targets the client's direct-connection
    /// factory applies: at most one per endpoint, reused when the
    /// session id matches.
    async fn call_for_signal(
        &self,
        session_id: &str,
        endpoint_id: &str,
        target: SignalTarget,
        create: bool,
    ) -> Option<Arc<Call>>;

    /// A reconnect just established a fresh session; re-register
    /// everything the client had joined. An error here fails the
    /// reconnect attempt and the channel retries.
    async fn on_reconnect_established(&self) -> anyhow::Result<()>;

    /// A connection joined or left an observed group.
    async fn on_membership(&self, membership: GroupMembership);

    /// A presence report for an observed endpoint arrived.
    async fn on_presence(&self, endpoint_id: &str, connection_id: &str, presence: Presence);
}

impl SignalingChannel {
    /// Dispatch one inbound signal to its call.
    pub async fn route_signal(self: &Arc<Self>, signal: SignalingMessage) -> Result<(), RoutingError> {
        let target = signal.target.ok_or(RoutingError::MissingTarget)?;

        // Transport-level ack; meaningless to application state.
        if matches!(signal.payload, SignalPayload::Ack { .. }) {
            debug!(target: "Signaling/Route", "Dropping ack for session {}", signal.session_id);
            return Ok(());
        }

        let call = self.resolve_call(&signal, target).await?;
        let Some(call) = call else {
            debug!(
                target: "Signaling/Route",
                "No call for {} signal in session {}; dropped",
                signal.payload.signal_type(),
                signal.session_id,
            );
            return Ok(());
        };

        // A resolved call whose id disagrees with the session is a stray
        // from an older negotiation.
        if call.id() != signal.session_id {
            warn!(
                target: "Signaling/Route",
                "Orphan {} signal: session {} resolved to call {}",
                signal.payload.signal_type(),
                signal.session_id,
                call.id(),
            );
            return Err(RoutingError::Orphan {
                session_id: signal.session_id,
            });
        }

        // Losing-fork rule: once the caller has picked a winning callee
        // connection, byes from the forks that lost must not tear the
        // call down.
        if let SignalPayload::Bye { .. } = &signal.payload
            && call.caller()
            && let Some(winner) = call.remote_connection_id()
            && winner != signal.from_connection
        {
            warn!(
                target: "Signaling/Route",
                "Dropping bye from losing fork {} (winner {}) for call {}",
                signal.from_connection,
                winner,
                call.id(),
            );
            return Ok(());
        }

        match signal.payload.clone() {
            SignalPayload::Offer { session_description } => {
                call.handle_offer(&signal, session_description).await;
            }
            SignalPayload::Answer { session_description } => {
                call.handle_answer(&signal, session_description).await;
            }
            SignalPayload::Connected => {
                call.handle_connected(&signal).await;
            }
            SignalPayload::IceCandidates { ice_candidates } => {
                call.handle_candidates(&signal, ice_candidates).await;
            }
            SignalPayload::Modify { action } => {
                call.handle_modify(&signal, action).await;
            }
            SignalPayload::Bye { reason } => {
                call.handle_hangup(&signal, reason).await;
            }
            SignalPayload::Ack { .. } => unreachable!("acks dropped above"),
        }
        Ok(())
    }

    /// Resolve the call a signal belongs to, creating one on a first
    /// offer for an unknown session.
    async fn resolve_call(
        self: &Arc<Self>,
        signal: &SignalingMessage,
        target: SignalTarget,
    ) -> Result<Option<Arc<Call>>, RoutingError> {
        if let Some(existing) = self.lookup_call(&signal.session_id).await {
            return Ok(Some(existing));
        }

        let create = matches!(signal.payload, SignalPayload::Offer { .. });
        if !create && target != SignalTarget::DirectConnection {
            return Ok(None);
        }

        let delegate = self
            .delegate
            .read()
            .await
            .clone()
            .and_then(|d| d.upgrade())
            .ok_or(RoutingError::NoDelegate)?;

        let call = delegate
            .call_for_signal(&signal.session_id, &signal.from_endpoint, target, create)
            .await;
        if let Some(call) = &call {
            self.register_call(&signal.session_id, call).await;
        }
        Ok(call)
    }

    async fn lookup_call(&self, session_id: &str) -> Option<Arc<Call>> {
        let mut calls = self.calls.write().await;
        match calls.get(session_id) {
            Some(weak) => match weak.upgrade() {
                Some(call) => Some(call),
                None => {
                    calls.remove(session_id);
                    None
                }
            },
            None => None,
        }
    }

    /// Fan out one non-response frame.
    pub(crate) async fn handle_push(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::Response { .. } => unreachable!("responses resolved earlier"),
            InboundFrame::Signal { body } => {
                let signal: SignalingMessage = match serde_json::from_str(&body) {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!(target: "Signaling/Recv", "Malformed signal dropped: {e}");
                        return;
                    }
                };
                if let Err(e) = self.route_signal(signal).await {
                    warn!(target: "Signaling/Route", "Signal routing failed: {e}");
                }
            }
            InboundFrame::Pubsub { header, message } => {
                EventBus::emit(
                    &self.bus.group_message,
                    Arc::new(GroupMessage {
                        group_id: header.channel.unwrap_or_default(),
                        from_endpoint: header.from.unwrap_or_default(),
                        from_connection: header.from_connection,
                        body: message,
                    }),
                );
            }
            InboundFrame::Join {
                header,
                endpoint_id,
                connection_id,
            } => {
                self.notify_membership(header.channel, endpoint_id, connection_id, true)
                    .await;
            }
            InboundFrame::Leave {
                header,
                endpoint_id,
                connection_id,
            } => {
                self.notify_membership(header.channel, endpoint_id, connection_id, false)
                    .await;
            }
            InboundFrame::Message {
                header,
                body,
                timestamp,
            } => {
                let timestamp = timestamp
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .unwrap_or_else(chrono::Utc::now);
                EventBus::emit(
                    &self.bus.message,
                    Arc::new(MessageReceived {
                        from_endpoint: header.from.unwrap_or_default(),
                        from_connection: header.from_connection,
                        body,
                        timestamp,
                    }),
                );
            }
            InboundFrame::Presence {
                header,
                presence,
                status: _,
            } => {
                let endpoint = header.from.unwrap_or_default();
                let connection = header.from_connection.unwrap_or_default();
                let presence = Presence::from_wire(&presence);
                if let Some(delegate) = self.delegate.read().await.clone().and_then(|d| d.upgrade())
                {
                    delegate.on_presence(&endpoint, &connection, presence).await;
                }
            }
        }
    }

    async fn notify_membership(
        &self,
        channel: Option<String>,
        endpoint_id: String,
        connection_id: String,
        joined: bool,
    ) {
        let membership = GroupMembership {
            group_id: channel.unwrap_or_default(),
            endpoint_id,
            connection_id,
            joined,
        };
        if let Some(delegate) = self.delegate.read().await.clone().and_then(|d| d.upgrade()) {
            delegate.on_membership(membership.clone()).await;
        }
        EventBus::emit(&self.bus.group_membership, Arc::new(membership));
    }
}
