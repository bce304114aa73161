//! Calls: one peer-to-peer media or data session per instance.
//!
//! A call aggregates its state machine, its peer-connection handle, and a
//! reference to the signaling channel. Signals drive state transitions and
//! state transitions emit signals; everything else is glue.

pub mod direct;
pub mod peer;
pub mod state;

use crate::signaling::SignalingChannel;
use crate::signaling::request::RpcError;
use crate::signaling::signals::SignalOptions;
use crate::types::events::{CallSignal, CallStateChange, EventBus};
use crate::types::signal::{
    CallerId, IceCandidate, ModifyAction, SessionDescription, SignalTarget, SignalingMessage,
    generate_signal_id,
};
use direct::DirectConnection;
use log::{debug, info, warn};
use peer::{PeerConnection, PeerConnectionEvent};
use state::{CallEvent, CallFsm, CallStateName, Transition};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling channel has gone away")]
    ChannelGone,
    #[error(transparent)]
    Signaling(#[from] RpcError),
    #[error("peer connection error: {0}")]
    Peer(#[from] anyhow::Error),
    #[error("call has no peer connection attached")]
    NoPeerConnection,
}

/// Parameters for creating a call.
#[derive(Debug, Clone)]
pub struct CallParams {
    /// Session id. Generated for outbound calls, taken from the offer for
    /// inbound ones.
    pub id: Option<String>,
    /// True when this side emits the first offer.
    pub caller: bool,
    pub remote_endpoint: String,
    pub target: SignalTarget,
    pub caller_id: Option<CallerId>,
    pub metadata: Option<serde_json::Value>,
}

impl CallParams {
    pub fn outbound(remote_endpoint: impl Into<String>, target: SignalTarget) -> Self {
        Self {
            id: None,
            caller: true,
            remote_endpoint: remote_endpoint.into(),
            target,
            caller_id: None,
            metadata: None,
        }
    }

    pub fn inbound(
        session_id: impl Into<String>,
        remote_endpoint: impl Into<String>,
        target: SignalTarget,
    ) -> Self {
        Self {
            id: Some(session_id.into()),
            caller: false,
            remote_endpoint: remote_endpoint.into(),
            target,
            caller_id: None,
            metadata: None,
        }
    }
}

pub struct Call {
    id: String,
    target: SignalTarget,
    remote_endpoint: String,
    caller_id: Option<CallerId>,
    metadata: Option<serde_json::Value>,

    fsm: StdMutex<CallFsm>,
    /// Winning remote connection, set by the first answer (caller side)
    /// or the offer (callee side).
    remote_connection: StdMutex<Option<String>>,
    remote_sdp: StdMutex<Option<SessionDescription>>,
    /// Candidates that arrived before a peer connection was attached.
    pending_candidates: StdMutex<Vec<IceCandidate>>,

    pc: Mutex<Option<Arc<dyn PeerConnection>>>,
    direct: StdMutex<Option<Arc<DirectConnection>>>,

    channel: Weak<SignalingChannel>,
    bus: Arc<EventBus>,
}

impl Call {
    pub fn new(
        params: CallParams,
        channel: &Arc<SignalingChannel>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let id = params.id.unwrap_or_else(generate_signal_id);
        let mut fsm = CallFsm::new(params.caller);

        let hook_bus = bus.clone();
        let hook_id = id.clone();
        fsm.on_transition(move |t: &Transition| {
            EventBus::emit(
                &hook_bus.call_state,
                Arc::new(CallStateChange {
                    call_id: hook_id.clone(),
                    from: t.from,
                    to: t.to,
                    event: t.event,
                }),
            );
        });

        Arc::new(Self {
            id,
            target: params.target,
            remote_endpoint: params.remote_endpoint,
            caller_id: params.caller_id,
            metadata: params.metadata,
            fsm: StdMutex::new(fsm),
            remote_connection: StdMutex::new(None),
            remote_sdp: StdMutex::new(None),
            pending_candidates: StdMutex::new(Vec::new()),
            pc: Mutex::new(None),
            direct: StdMutex::new(None),
            channel: Arc::downgrade(channel),
            bus,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> SignalTarget {
        self.target
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    pub fn caller(&self) -> bool {
        self.fsm.lock().unwrap().caller()
    }

    pub fn state(&self) -> CallStateName {
        self.fsm.lock().unwrap().state()
    }

    pub fn is_active(&self) -> bool {
        self.fsm.lock().unwrap().is_active()
    }

    pub fn is_modifying(&self) -> bool {
        self.fsm.lock().unwrap().is_modifying()
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn remote_connection_id(&self) -> Option<String> {
        self.remote_connection.lock().unwrap().clone()
    }

    pub(crate) fn direct_connection(&self) -> Option<Arc<DirectConnection>> {
        self.direct.lock().unwrap().clone()
    }

    pub(crate) async fn pc_handle(&self) -> Option<Arc<dyn PeerConnection>> {
        self.pc.lock().await.clone()
    }

    pub(crate) fn set_direct_connection(&self, direct: Arc<DirectConnection>) {
        *self.direct.lock().unwrap() = Some(direct);
    }

    fn channel(&self) -> Result<Arc<SignalingChannel>, CallError> {
        self.channel.upgrade().ok_or(CallError::ChannelGone)
    }

    fn fire(&self, event: CallEvent) -> Option<Transition> {
        self.fsm.lock().unwrap().dispatch(event)
    }

    /// Dispatch one raw state-machine event. For the owning client; call
    /// methods cover the usual flows.
    pub(crate) fn dispatch_event(&self, event: CallEvent) -> Option<Transition> {
        self.fire(event)
    }

    fn signal_options(&self) -> SignalOptions {
        let mut options = SignalOptions::new(
            self.remote_endpoint.clone(),
            self.id.clone(),
            self.target,
        );
        options.caller_id = self.caller_id.clone();
        options.metadata = self.metadata.clone();
        if let Some(connection) = self.remote_connection_id() {
            options = options.to_connection(connection);
        }
        options
    }

    fn emit_signal_event(&self, kind: &'static str, signal: &SignalingMessage) {
        EventBus::emit(
            &self.bus.call_signal,
            Arc::new(CallSignal {
                call_id: self.id.clone(),
                kind,
                from_endpoint: signal.from_endpoint.clone(),
                from_connection: signal.from_connection.clone(),
            }),
        );
    }

    /// Begin negotiating. For the caller this runs initiate, answer, and
    /// the device-access approval; content approval and media arrival
    /// follow through [`approve`] and the peer-connection events.
    ///
    /// [`approve`]: Call::approve
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let listening = match self.channel() {
            Ok(channel) => channel.delegate_listening().await,
            Err(_) => false,
        };

        self.settle(self.fire(CallEvent::Initiate {
            client_listening: listening,
        }))
        .await;
        if self.state() == CallStateName::Terminated {
            warn!(
                target: "Call",
                "Call {} terminated at initiate: no call listener registered", self.id
            );
            return Ok(());
        }

        self.settle(self.fire(CallEvent::Answer)).await;
        self.settle(self.fire(CallEvent::Approve)).await;
        Ok(())
    }

    /// Callee accepts the incoming call and begins device approval.
    pub async fn answer(self: &Arc<Self>) -> Result<(), CallError> {
        self.settle(self.fire(CallEvent::Answer)).await;
        self.settle(self.fire(CallEvent::Approve)).await;
        Ok(())
    }

    /// Grant the pending approval step (device access first, content
    /// second). Negotiation proceeds once both approval and media are in.
    pub async fn approve(self: &Arc<Self>) -> Result<(), CallError> {
        let transition = self.fire(CallEvent::Approve);
        self.settle(transition).await;
        self.negotiate_if_ready(transition).await
    }

    /// Local media finished gathering.
    pub async fn local_media_ready(self: &Arc<Self>) -> Result<(), CallError> {
        let transition = self.fire(CallEvent::ReceiveLocalMedia);
        self.settle(transition).await;
        self.negotiate_if_ready(transition).await
    }

    /// Remote media started flowing.
    pub async fn remote_media_ready(self: &Arc<Self>) {
        self.settle(self.fire(CallEvent::ReceiveRemoteMedia)).await;
    }

    /// Decline the call. Before media flows this tears the call down and
    /// sends a `bye`; afterwards it is a no-op on the established call.
    pub async fn reject(self: &Arc<Self>) -> Result<(), CallError> {
        let transition = self.fire(CallEvent::Reject);
        if let Some(t) = transition
            && t.to == CallStateName::Terminated
        {
            self.send_bye(None).await;
            self.teardown().await;
        } else {
            self.settle(transition).await;
        }
        Ok(())
    }

    /// Hang the call up, notifying the remote side unless `send_signal`
    /// is false (used when the teardown came *from* the remote side).
    pub async fn hangup(self: &Arc<Self>, send_signal: bool) -> Result<(), CallError> {
        let transition = self.fire(CallEvent::Hangup);
        if transition.is_some() {
            if send_signal {
                self.send_bye(None).await;
            }
            self.teardown().await;
        }
        Ok(())
    }

    /// Ask the remote side to renegotiate the established call.
    pub async fn modify(self: &Arc<Self>) -> Result<(), CallError> {
        let transition = self.fire(CallEvent::Modify { receive: false });
        if transition.is_none() {
            debug!(target: "Call", "modify ignored outside connected, call {}", self.id);
            return Ok(());
        }
        let channel = self.channel()?;
        channel
            .send_modify(self.signal_options(), ModifyAction::Initiate)
            .await?;
        Ok(())
    }

    /// Accept a remote modify request: re-prepare as the callee of the
    /// renegotiation and start the answer flow over.
    pub async fn accept_modify(self: &Arc<Self>) -> Result<(), CallError> {
        let channel = self.channel()?;
        channel
            .send_modify(self.signal_options(), ModifyAction::Accept)
            .await?;
        self.settle(self.fire(CallEvent::Modify { receive: true })).await;
        self.settle(self.fire(CallEvent::Answer)).await;
        self.settle(self.fire(CallEvent::Approve)).await;
        Ok(())
    }

    /// Decline a remote modify request; this side never leaves connected
    /// and the initiator drops back to connected on receipt.
    pub async fn reject_modify(self: &Arc<Self>) -> Result<(), CallError> {
        let channel = self.channel()?;
        channel
            .send_modify(self.signal_options(), ModifyAction::Reject)
            .await?;
        Ok(())
    }

    /// Attach the platform peer connection and start pumping its events.
    pub async fn attach_peer_connection(
        self: &Arc<Self>,
        pc: Arc<dyn PeerConnection>,
        events: mpsc::Receiver<PeerConnectionEvent>,
    ) {
        *self.pc.lock().await = Some(pc);
        self.drain_candidates().await;
        self.spawn_event_pump(events);
    }

    /// Feed candidates that arrived early into the peer connection.
    async fn drain_candidates(self: &Arc<Self>) {
        let Some(pc) = self.pc.lock().await.clone() else {
            return;
        };
        let buffered: Vec<IceCandidate> =
            self.pending_candidates.lock().unwrap().drain(..).collect();
        for candidate in &buffered {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!(target: "Call", "Buffered candidate rejected: {e}");
            }
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::Receiver<PeerConnectionEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(call) = weak.upgrade() else { return };
                call.handle_peer_event(event).await;
            }
        });
    }

    async fn handle_peer_event(self: &Arc<Self>, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                if let Ok(channel) = self.channel()
                    && let Err(e) = channel
                        .send_candidates(self.signal_options(), vec![candidate])
                        .await
                {
                    warn!(target: "Call", "Candidate relay failed for {}: {e}", self.id);
                }
            }
            PeerConnectionEvent::LocalMediaReceived => {
                if let Err(e) = self.local_media_ready().await {
                    warn!(target: "Call", "Local media handling failed for {}: {e}", self.id);
                }
            }
            PeerConnectionEvent::RemoteMediaReceived => {
                self.remote_media_ready().await;
            }
            PeerConnectionEvent::Stats(report) => {
                if let Ok(channel) = self.channel() {
                    channel
                        .send_call_debug(serde_json::json!({
                            "sessionId": self.id.clone(),
                            "stats": report,
                        }))
                        .await;
                }
            }
            PeerConnectionEvent::DirectConnectionOpen => {
                if let Some(direct) = self.direct_connection() {
                    direct.notify_open();
                }
            }
            PeerConnectionEvent::DirectConnectionMessage(message) => {
                if let Some(direct) = self.direct_connection() {
                    direct.notify_message(message);
                }
            }
            PeerConnectionEvent::DirectConnectionClose => {
                if let Some(direct) = self.direct_connection() {
                    direct.notify_close();
                }
            }
        }
    }

    /// Run the negotiation step a transition unlocked: the caller emits
    /// an offer on entering `offering`, the callee an answer on entering
    /// `connecting`.
    async fn negotiate_if_ready(
        self: &Arc<Self>,
        transition: Option<Transition>,
    ) -> Result<(), CallError> {
        let Some(transition) = transition else {
            return Ok(());
        };
        match transition.to {
            CallStateName::Offering if self.caller() => self.emit_offer().await,
            CallStateName::Connecting if !self.caller() => self.emit_answer().await,
            _ => Ok(()),
        }
    }

    async fn emit_offer(self: &Arc<Self>) -> Result<(), CallError> {
        let channel = self.channel()?;
        let pc = self.pc.lock().await.clone().ok_or(CallError::NoPeerConnection)?;
        let offer = pc.create_offer().await?;
        channel.send_sdp(self.signal_options(), offer).await?;
        self.settle(self.fire(CallEvent::SentOffer)).await;
        info!(target: "Call", "Offer sent for call {}", self.id);
        Ok(())
    }

    async fn emit_answer(self: &Arc<Self>) -> Result<(), CallError> {
        let channel = self.channel()?;
        let pc = self.pc.lock().await.clone().ok_or(CallError::NoPeerConnection)?;
        let remote = self
            .remote_sdp
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CallError::Peer(anyhow::anyhow!("no remote offer stored")))?;
        let answer = pc.create_answer(&remote).await?;
        channel.send_sdp(self.signal_options(), answer).await?;
        info!(target: "Call", "Answer sent for call {}", self.id);
        Ok(())
    }

    // ---- inbound signal handlers, invoked by the routing layer ----

    pub(crate) async fn handle_offer(
        self: &Arc<Self>,
        signal: &SignalingMessage,
        description: SessionDescription,
    ) {
        *self.remote_sdp.lock().unwrap() = Some(description);
        // The offer pins the callee to the caller's connection.
        *self.remote_connection.lock().unwrap() = Some(signal.from_connection.clone());
        self.emit_signal_event("offer", signal);
    }

    pub(crate) async fn handle_answer(
        self: &Arc<Self>,
        signal: &SignalingMessage,
        description: SessionDescription,
    ) {
        if !self.caller() {
            debug!(target: "Call", "Ignoring answer on callee side of {}", self.id);
            return;
        }

        {
            let mut winner = self.remote_connection.lock().unwrap();
            match &*winner {
                Some(existing) if *existing != signal.from_connection => {
                    debug!(
                        target: "Call",
                        "Late answer from {} ignored; {} already won call {}",
                        signal.from_connection, existing, self.id
                    );
                    return;
                }
                _ => *winner = Some(signal.from_connection.clone()),
            }
        }

        if let Some(pc) = self.pc.lock().await.clone()
            && let Err(e) = pc.set_remote_description(&description).await
        {
            warn!(target: "Call", "Remote description rejected for {}: {e}", self.id);
        }
        self.drain_candidates().await;

        self.settle(self.fire(CallEvent::ReceiveAnswer)).await;
        self.emit_signal_event("answer", signal);

        // Confirm the winner; other forks of the callee see they lost.
        // Detached: this handler runs on the read loop, which must stay
        // free to deliver the RPC's own response frame.
        let call = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(channel) = call.channel()
                && let Err(e) = channel.send_connected(call.signal_options()).await
            {
                warn!(target: "Call", "Connected signal failed for {}: {e}", call.id);
            }
        });
    }

    pub(crate) async fn handle_connected(self: &Arc<Self>, signal: &SignalingMessage) {
        self.emit_signal_event("connected", signal);
    }

    pub(crate) async fn handle_candidates(
        self: &Arc<Self>,
        signal: &SignalingMessage,
        candidates: Vec<IceCandidate>,
    ) {
        self.emit_signal_event("iceCandidates", signal);
        let pc = self.pc.lock().await.clone();
        match pc {
            Some(pc) => {
                for candidate in &candidates {
                    if let Err(e) = pc.add_ice_candidate(candidate).await {
                        warn!(target: "Call", "Candidate rejected for {}: {e}", self.id);
                    }
                }
            }
            None => {
                self.pending_candidates.lock().unwrap().extend(candidates);
            }
        }
    }

    pub(crate) async fn handle_modify(
        self: &Arc<Self>,
        signal: &SignalingMessage,
        action: ModifyAction,
    ) {
        self.emit_signal_event("modify", signal);
        match action {
            // The application decides: accept_modify re-prepares, while
            // reject_modify answers without ever leaving connected.
            ModifyAction::Initiate => {}
            ModifyAction::Accept => {
                self.settle(self.fire(CallEvent::Accept)).await;
            }
            ModifyAction::Reject => {
                self.settle(self.fire(CallEvent::Reject)).await;
            }
        }
    }

    pub(crate) async fn handle_hangup(
        self: &Arc<Self>,
        signal: &SignalingMessage,
        reason: Option<String>,
    ) {
        debug!(
            target: "Call",
            "Remote hangup for call {}: {:?}", self.id, reason
        );
        self.emit_signal_event("bye", signal);
        // Duplicate byes are idempotent: the machine is already terminal.
        if self.fire(CallEvent::Hangup).is_some() {
            self.teardown().await;
        }
    }

    // ---- teardown ----

    async fn send_bye(self: &Arc<Self>, reason: Option<String>) {
        if let Ok(channel) = self.channel()
            && let Err(e) = channel.send_hangup(self.signal_options(), reason).await
        {
            debug!(target: "Call", "Bye delivery failed for {}: {e}", self.id);
        }
    }

    /// Apply the side of a transition every path shares: teardown on
    /// entering `terminated`.
    async fn settle(self: &Arc<Self>, transition: Option<Transition>) {
        if let Some(t) = transition
            && t.to == CallStateName::Terminated
        {
            self.teardown().await;
        }
    }

    async fn teardown(self: &Arc<Self>) {
        if let Some(direct) = self.direct.lock().unwrap().take() {
            direct.notify_close();
        }
        if let Some(pc) = self.pc.lock().await.take() {
            pc.close().await;
        }
        if let Some(channel) = self.channel.upgrade() {
            channel.unregister_call(&self.id).await;
        }
        info!(target: "Call", "Call {} destroyed", self.id);
    }
}
