//! Outbound signals and the remaining channel operations.
//!
//! `send_signal` produces the wire envelope; the `send_*` wrappers fix the
//! signal type and validate the field set before it goes out.

use super::SignalingChannel;
use super::frames::{append_query, fill_path};
use super::request::{RpcError, RpcResponse};
use crate::http::Method;
use crate::types::presence::Presence;
use crate::types::signal::{
    CallerId, IceCandidate, ModifyAction, SessionDescription, SignalPayload, SignalTarget,
    SignalingMessage, generate_signal_id,
};
use log::debug;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Addressing for one outbound signal.
#[derive(Debug, Clone)]
pub struct SignalOptions {
    /// Remote endpoint id.
    pub recipient: String,
    /// Session the signal belongs to.
    pub session_id: String,
    /// Pin the signal to one remote connection instead of fanning out.
    pub connection_id: Option<String>,
    pub target: SignalTarget,
    /// Echo the signal to this client's other connections.
    pub cc_self: bool,
    pub caller_id: Option<CallerId>,
    pub metadata: Option<serde_json::Value>,
}

impl SignalOptions {
    pub fn new(
        recipient: impl Into<String>,
        session_id: impl Into<String>,
        target: SignalTarget,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            session_id: session_id.into(),
            connection_id: None,
            target,
            cc_self: true,
            caller_id: None,
            metadata: None,
        }
    }

    pub fn to_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}

/// Parameters for an application text message.
#[derive(Debug, Clone)]
pub struct MessageOptions {
    pub recipient: String,
    pub message: String,
    pub connection_id: Option<String>,
    pub cc_self: bool,
    pub push: bool,
}

impl MessageOptions {
    pub fn new(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            message: message.into(),
            connection_id: None,
            cc_self: true,
            push: false,
        }
    }
}

/// Ephemeral ICE server list handed out by the service.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentials {
    pub uris: Vec<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ttl: u64,
}

/// Cached credentials with their fetch time.
#[derive(Debug, Clone)]
pub struct CachedTurnCredentials {
    pub credentials: TurnCredentials,
    pub fetched_at: Instant,
}

impl CachedTurnCredentials {
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() > Duration::from_secs(self.credentials.ttl)
    }
}

impl SignalingChannel {
    /// Build, serialize, and send one signal. Resolves on the server ack.
    pub async fn send_signal(
        &self,
        options: SignalOptions,
        payload: SignalPayload,
    ) -> Result<(), RpcError> {
        let from_endpoint = self.endpoint_id().await.unwrap_or_default();
        let from_connection = self.connection_id().await.unwrap_or_default();

        let message = SignalingMessage {
            signal_id: generate_signal_id(),
            session_id: options.session_id.clone(),
            target: Some(options.target),
            from_endpoint,
            from_connection,
            to_original: None,
            caller_id: options.caller_id.clone(),
            metadata: options.metadata.clone(),
            payload,
        };

        debug!(
            target: "Signaling/Send",
            "signal {} {} -> {} (session {})",
            message.payload.signal_type(),
            message.signal_id,
            options.recipient,
            options.session_id,
        );

        let signal_text = serde_json::to_string(&message).map_err(|_| RpcError::Parse)?;
        let mut body = json!({
            "signal": signal_text,
            "to": options.recipient.clone(),
            "toType": options.target.as_str(),
            "ccSelf": options.cc_self,
        });
        if let Some(connection) = &options.connection_id {
            body["toConnection"] = json!(connection);
        }

        self.request(Method::Post, "/v1/signaling", Some(body))
            .await
            .map(|_| ())
    }

    /// Send a session description. The description must be an offer or an
    /// answer; anything else is a local usage error.
    pub async fn send_sdp(
        &self,
        options: SignalOptions,
        description: SessionDescription,
    ) -> Result<(), RpcError> {
        let payload = match description.kind.as_str() {
            "offer" => SignalPayload::Offer {
                session_description: description,
            },
            "answer" => SignalPayload::Answer {
                session_description: description,
            },
            other => {
                return Err(RpcError::InvalidArgument(format!(
                    "sendSDP requires an offer or answer, got `{other}`"
                )));
            }
        };
        self.send_signal(options, payload).await
    }

    /// Relay gathered ICE candidates.
    pub async fn send_candidates(
        &self,
        options: SignalOptions,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), RpcError> {
        self.send_signal(options, SignalPayload::IceCandidates {
            ice_candidates: candidates,
        })
        .await
    }

    /// Tell the winning remote connection the call is established.
    pub async fn send_connected(&self, options: SignalOptions) -> Result<(), RpcError> {
        self.send_signal(options, SignalPayload::Connected).await
    }

    /// Send a `bye` for the session.
    pub async fn send_hangup(
        &self,
        options: SignalOptions,
        reason: Option<String>,
    ) -> Result<(), RpcError> {
        self.send_signal(options, SignalPayload::Bye { reason }).await
    }

    /// Send a renegotiation verb.
    pub async fn send_modify(
        &self,
        options: SignalOptions,
        action: ModifyAction,
    ) -> Result<(), RpcError> {
        self.send_signal(options, SignalPayload::Modify { action }).await
    }

    /// Send an application text message to an endpoint.
    pub async fn send_message(&self, options: MessageOptions) -> Result<(), RpcError> {
        let mut body = json!({
            "to": options.recipient.clone(),
            "message": options.message.clone(),
            "ccSelf": options.cc_self,
            "push": options.push,
        });
        if let Some(connection) = &options.connection_id {
            body["toConnection"] = json!(connection);
        }
        self.request(Method::Post, "/v1/messages", Some(body))
            .await
            .map(|_| ())
    }

    /// Publish this client's own presence.
    pub async fn set_presence(
        &self,
        presence: Presence,
        status: Option<String>,
    ) -> Result<(), RpcError> {
        let mut body = json!({ "presence": { "type": presence.as_str() } });
        if let Some(status) = status {
            body["presence"]["status"] = json!(status);
        }
        self.request(Method::Post, "/v1/presence", Some(body))
            .await
            .map(|_| ())
    }

    /// Fetch the ephemeral ICE server list, reusing an unexpired cache.
    pub async fn get_turn_credentials(&self) -> Result<TurnCredentials, RpcError> {
        {
            let guard = self.turn_cache.read().await;
            if let Some(cached) = &*guard
                && !cached.is_expired()
            {
                return Ok(cached.credentials.clone());
            }
        }

        let response = self.request(Method::Get, "/v1/turn", None).await?;
        let credentials: TurnCredentials =
            serde_json::from_value(response.body).map_err(|_| RpcError::Parse)?;

        *self.turn_cache.write().await = Some(CachedTurnCredentials {
            credentials: credentials.clone(),
            fetched_at: Instant::now(),
        });
        Ok(credentials)
    }

    /// Create a group channel ahead of joining it.
    pub async fn create_group(&self, group_id: &str) -> Result<(), RpcError> {
        self.request(
            Method::Post,
            "/v1/channels/",
            Some(json!({ "name": group_id })),
        )
        .await
        .map(|_| ())
    }

    /// Publish a message to every subscriber of a group.
    pub async fn publish_to_group(
        &self,
        group_id: &str,
        message: serde_json::Value,
    ) -> Result<(), RpcError> {
        let path = fill_path("/v1/channels/{id}/publish/", &path_params("id", group_id));
        self.request(Method::Post, &path, Some(json!({ "message": message })))
            .await
            .map(|_| ())
    }

    /// List the connections currently subscribed to a group.
    pub async fn get_group_members(&self, group_id: &str) -> Result<RpcResponse, RpcError> {
        let path = fill_path("/v1/channels/{id}/subscribers/", &path_params("id", group_id));
        self.request(Method::Get, &path, None).await
    }

    /// Fetch recent messages published to a group.
    pub async fn get_group_history(
        &self,
        group_id: &str,
        limit: Option<u32>,
    ) -> Result<RpcResponse, RpcError> {
        let mut path = fill_path("/v1/groups/{group}/history", &path_params("group", group_id));
        if let Some(limit) = limit {
            path = append_query(&path, &json!({ "limit": limit }));
        }
        self.request(Method::Get, &path, None).await
    }

    /// Remove a participant from a conference, or with `endpoint_id`
    /// absent, tear the whole conference down.
    pub async fn destroy_conference(
        &self,
        conference_id: &str,
        endpoint_id: Option<&str>,
    ) -> Result<(), RpcError> {
        let path = match endpoint_id {
            Some(endpoint) => {
                let mut params = path_params("id", conference_id);
                params.insert("endpointId", endpoint.to_string());
                fill_path("/v1/conferences/{id}/participants/{endpointId}", &params)
            }
            None => fill_path("/v1/conferences/{id}", &path_params("id", conference_id)),
        };
        self.request(Method::Delete, &path, None).await.map(|_| ())
    }

    /// Post a call-debug report. Gated by configuration; failures are
    /// logged and swallowed so diagnostics never break call flow.
    pub async fn send_call_debug(self: &Arc<Self>, report: serde_json::Value) {
        if !self.config.debug_reports {
            return;
        }
        if let Err(e) = self
            .request(Method::Post, "/v1/call-debugs", Some(report))
            .await
        {
            debug!(target: "Signaling", "Call debug report failed: {e}");
        }
    }
}

fn path_params(name: &'static str, value: &str) -> HashMap<&'static str, String> {
    let mut params = HashMap::new();
    params.insert(name, value.to_string());
    params
}
