//! The owning client: endpoint and group bookkeeping, the call index, and
//! the high-level API tying the channel and calls together.

use crate::calls::direct::DirectConnection;
use crate::calls::peer::PeerConnectionFactory;
use crate::calls::state::CallStateName;
use crate::calls::{Call, CallError, CallParams};
use crate::http::HttpClient;
use crate::signaling::batch::BatchHandle;
use crate::signaling::request::RpcError;
use crate::signaling::routing::SignalingDelegate;
use crate::signaling::signals::{MessageOptions, TurnCredentials};
use crate::signaling::{AuthParams, ChannelConfig, SignalingChannel};
use crate::transport::TransportFactory;
use crate::types::endpoint::{Connection, Endpoint};
use crate::types::events::{
    CallStateChange, DirectConnectionEvent, EventBus, GroupMembership, IncomingCall,
    MessageReceived, PresenceUpdate,
};
use crate::types::presence::Presence;
use crate::types::signal::SignalTarget;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error(transparent)]
    Signaling(#[from] RpcError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("no peer connection factory configured")]
    NoPeerConnectionFactory,
}

/// A group this client has joined.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub id: String,
    /// `(endpoint_id, connection_id)` pairs observed in the group.
    pub members: HashSet<(String, String)>,
}

pub struct Client {
    channel: Arc<SignalingChannel>,
    bus: Arc<EventBus>,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    calls: RwLock<HashMap<String, Arc<Call>>>,
    groups: RwLock<HashMap<String, Group>>,
    listening_for_calls: AtomicBool,
    pc_factory: RwLock<Option<Arc<dyn PeerConnectionFactory>>>,
    reaper_started: AtomicBool,
}

impl Client {
    pub fn new(
        config: ChannelConfig,
        http: Arc<dyn HttpClient>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let channel = SignalingChannel::new(config, http, transport_factory, bus.clone());
        Arc::new(Self {
            channel,
            bus,
            endpoints: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            listening_for_calls: AtomicBool::new(false),
            pc_factory: RwLock::new(None),
            reaper_started: AtomicBool::new(false),
        })
    }

    pub fn signaling(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Install the factory used to build peer connections for new calls.
    pub async fn set_peer_connection_factory(&self, factory: Arc<dyn PeerConnectionFactory>) {
        *self.pc_factory.write().await = Some(factory);
    }

    /// Authenticate and open the duplex session.
    pub async fn connect(self: &Arc<Self>, auth: AuthParams) -> Result<(), ClientError> {
        let delegate: Arc<dyn SignalingDelegate> = self.clone();
        self.channel
            .set_delegate(Arc::downgrade(&delegate))
            .await;
        self.spawn_call_reaper();
        self.channel.open(auth).await?;
        Ok(())
    }

    /// Deregister and close the session.
    pub async fn disconnect(self: &Arc<Self>) {
        self.channel.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Declare interest in incoming calls and get the event stream for
    /// them. Calls arriving while nobody listens are terminated.
    pub fn listen_for_calls(&self) -> broadcast::Receiver<Arc<IncomingCall>> {
        self.listening_for_calls.store(true, Ordering::Relaxed);
        self.bus.incoming_call.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Arc<MessageReceived>> {
        self.bus.message.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<Arc<PresenceUpdate>> {
        self.bus.presence.subscribe()
    }

    pub fn subscribe_call_state(&self) -> broadcast::Receiver<Arc<CallStateChange>> {
        self.bus.call_state.subscribe()
    }

    pub fn subscribe_direct_connections(
        &self,
    ) -> broadcast::Receiver<Arc<DirectConnectionEvent>> {
        self.bus.direct_connection.subscribe()
    }

    // ---- lookups (the interfaces the core consumes) ----

    pub async fn get_call(&self, call_id: &str) -> Option<Arc<Call>> {
        self.calls.read().await.get(call_id).cloned()
    }

    pub async fn get_endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        self.endpoints.read().await.get(endpoint_id).cloned()
    }

    pub async fn get_connection(
        &self,
        endpoint_id: &str,
        connection_id: &str,
    ) -> Option<Connection> {
        self.endpoints
            .read()
            .await
            .get(endpoint_id)
            .and_then(|e| e.connection(connection_id).cloned())
    }

    pub async fn get_groups(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }

    // ---- calls ----

    /// Start an outbound call to an endpoint.
    pub async fn start_call(
        self: &Arc<Self>,
        endpoint_id: &str,
        target: SignalTarget,
    ) -> Result<Arc<Call>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let call = Call::new(
            CallParams::outbound(endpoint_id, target),
            &self.channel,
            self.bus.clone(),
        );
        self.channel.register_call(call.id(), &call).await;
        self.track_call(&call).await;

        self.attach_peer_connection(&call).await?;
        call.start().await?;
        // Content approval is granted up front; when the application wants
        // a preview step it drives `approve` itself instead.
        call.approve().await?;
        Ok(call)
    }

    /// Open a peer-to-peer data channel to an endpoint.
    pub async fn start_direct_connection(
        self: &Arc<Self>,
        endpoint_id: &str,
    ) -> Result<Arc<DirectConnection>, ClientError> {
        let call = self
            .start_call(endpoint_id, SignalTarget::DirectConnection)
            .await?;
        let direct = DirectConnection::new(&call, self.bus.clone());
        self.endpoints
            .write()
            .await
            .entry(endpoint_id.to_string())
            .or_insert_with(|| Endpoint::new(endpoint_id))
            .direct_connection_id = Some(call.id().to_string());
        Ok(direct)
    }

    async fn attach_peer_connection(&self, call: &Arc<Call>) -> Result<(), ClientError> {
        let factory = self
            .pc_factory
            .read()
            .await
            .clone()
            .ok_or(ClientError::NoPeerConnectionFactory)?;
        let (pc, events) = factory
            .create_peer_connection()
            .await
            .map_err(CallError::Peer)?;
        call.attach_peer_connection(pc, events).await;
        Ok(())
    }

    async fn track_call(&self, call: &Arc<Call>) {
        self.calls
            .write()
            .await
            .insert(call.id().to_string(), call.clone());
        self.endpoints
            .write()
            .await
            .entry(call.remote_endpoint().to_string())
            .or_insert_with(|| Endpoint::new(call.remote_endpoint()))
            .track_call(call.id());
    }

    /// Drop calls from the index the moment they terminate.
    fn spawn_call_reaper(self: &Arc<Self>) {
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut state_rx = self.bus.call_state.subscribe();
        tokio::spawn(async move {
            loop {
                let change = match state_rx.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "Client", "Call reaper lagged by {missed} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if change.to != CallStateName::Terminated {
                    continue;
                }
                let Some(client) = weak.upgrade() else { return };
                client.untrack_call(&change.call_id).await;
            }
        });
    }

    async fn untrack_call(&self, call_id: &str) {
        let removed = self.calls.write().await.remove(call_id);
        if let Some(call) = removed {
            let mut endpoints = self.endpoints.write().await;
            if let Some(endpoint) = endpoints.get_mut(call.remote_endpoint()) {
                endpoint.untrack_call(call_id);
                if endpoint.direct_connection_id.as_deref() == Some(call_id) {
                    endpoint.direct_connection_id = None;
                }
            }
            debug!(target: "Client", "Call {call_id} removed from index");
        }
    }

    // ---- groups and presence ----

    /// Join groups. Calls made in the same scheduler tick batch into one
    /// RPC; the returned handle is shared by every caller in the window.
    pub async fn join_group(self: &Arc<Self>, group_id: &str) -> BatchHandle {
        let ids = vec![group_id.to_string()];
        self.join_groups(&ids).await
    }

    pub async fn join_groups(self: &Arc<Self>, group_ids: &[String]) -> BatchHandle {
        {
            let mut groups = self.groups.write().await;
            for id in group_ids {
                groups.entry(id.clone()).or_insert_with(|| Group {
                    id: id.clone(),
                    members: HashSet::new(),
                });
            }
        }
        self.channel.join_groups(group_ids)
    }

    pub async fn leave_groups(self: &Arc<Self>, group_ids: &[String]) -> BatchHandle {
        {
            let mut groups = self.groups.write().await;
            for id in group_ids {
                groups.remove(id);
            }
        }
        self.channel.leave_groups(group_ids)
    }

    /// Subscribe to presence for endpoints; duplicates across successful
    /// registrations are suppressed.
    pub fn register_presence(self: &Arc<Self>, endpoint_ids: &[String]) -> BatchHandle {
        self.channel.register_presence(endpoint_ids)
    }

    pub async fn set_presence(
        &self,
        presence: Presence,
        status: Option<String>,
    ) -> Result<(), ClientError> {
        self.channel.set_presence(presence, status).await?;
        Ok(())
    }

    pub async fn send_message(&self, options: MessageOptions) -> Result<(), ClientError> {
        self.channel.send_message(options).await?;
        Ok(())
    }

    pub async fn get_turn_credentials(&self) -> Result<TurnCredentials, ClientError> {
        Ok(self.channel.get_turn_credentials().await?)
    }
}

#[async_trait]
impl SignalingDelegate for Client {
    fn is_listening_for_calls(&self) -> bool {
        self.listening_for_calls.load(Ordering::Relaxed)
    }

    async fn call_for_signal(
        &self,
        session_id: &str,
        endpoint_id: &str,
        target: SignalTarget,
        create: bool,
    ) -> Option<Arc<Call>> {
        if let Some(existing) = self.calls.read().await.get(session_id) {
            return Some(existing.clone());
        }

        if target == SignalTarget::DirectConnection {
            // At most one direct connection per endpoint. An existing one
            // is reused; a session mismatch surfaces as an orphan upstream.
            let existing_session = self
                .endpoints
                .read()
                .await
                .get(endpoint_id)
                .and_then(|e| e.direct_connection_id.clone());
            if let Some(session) = existing_session {
                return self.calls.read().await.get(&session).cloned();
            }
            if !create {
                return None;
            }
        } else if !create {
            return None;
        }

        let listening = self.is_listening_for_calls();
        let call = Call::new(
            CallParams::inbound(session_id, endpoint_id, target),
            &self.channel,
            self.bus.clone(),
        );
        self.track_call(&call).await;

        if target == SignalTarget::DirectConnection {
            DirectConnection::new(&call, self.bus.clone());
            self.endpoints
                .write()
                .await
                .entry(endpoint_id.to_string())
                .or_insert_with(|| Endpoint::new(endpoint_id))
                .direct_connection_id = Some(call.id().to_string());
        }

        if let Err(e) = self.attach_peer_connection(&call).await {
            warn!(
                target: "Client",
                "No peer connection for inbound call {session_id}: {e}"
            );
        }

        // Nobody listening: the machine goes straight to terminated and
        // the reaper cleans the index back up.
        use crate::calls::state::CallEvent;
        let transition = call.dispatch_event(CallEvent::Initiate {
            client_listening: listening,
        });
        if transition.map(|t| t.to) == Some(CallStateName::Terminated) {
            info!(
                target: "Client",
                "Inbound call {session_id} terminated: no listener registered"
            );
            return None;
        }

        EventBus::emit(
            &self.bus.incoming_call,
            Arc::new(IncomingCall {
                call_id: session_id.to_string(),
                remote_endpoint: endpoint_id.to_string(),
                target,
            }),
        );
        Some(call)
    }

    async fn on_reconnect_established(&self) -> anyhow::Result<()> {
        let group_ids = self.get_groups().await;
        if group_ids.is_empty() {
            return Ok(());
        }
        info!(
            target: "Client",
            "Rejoining {} group(s) after reconnect", group_ids.len()
        );
        self.channel
            .join_groups(&group_ids)
            .wait()
            .await
            .map_err(|e| anyhow::anyhow!("group rejoin failed: {e}"))
    }

    async fn on_membership(&self, membership: GroupMembership) {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get_mut(&membership.group_id) {
            let member = (
                membership.endpoint_id.clone(),
                membership.connection_id.clone(),
            );
            if membership.joined {
                group.members.insert(member);
            } else {
                group.members.remove(&member);
            }
        }
        drop(groups);

        let mut endpoints = self.endpoints.write().await;
        let endpoint = endpoints
            .entry(membership.endpoint_id.clone())
            .or_insert_with(|| Endpoint::new(&membership.endpoint_id));
        if membership.joined {
            endpoint.set_connection_presence(&membership.connection_id, Presence::Available);
        } else {
            endpoint.remove_connection(&membership.connection_id);
        }
    }

    async fn on_presence(&self, endpoint_id: &str, connection_id: &str, presence: Presence) {
        let resolved = {
            let mut endpoints = self.endpoints.write().await;
            let endpoint = endpoints
                .entry(endpoint_id.to_string())
                .or_insert_with(|| Endpoint::new(endpoint_id));
            if presence == Presence::Unavailable {
                endpoint.remove_connection(connection_id);
            } else {
                endpoint.set_connection_presence(connection_id, presence);
            }
            endpoint.resolved_presence()
        };

        EventBus::emit(
            &self.bus.presence,
            Arc::new(PresenceUpdate {
                endpoint_id: endpoint_id.to_string(),
                connection_id: connection_id.to_string(),
                presence,
                resolved,
            }),
        );
    }
}
