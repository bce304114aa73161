//! The signaling channel: one duplex session to the cloud service.
//!
//! The channel owns the transport socket and everything multiplexed over
//! it: RPC request/response pairs, unsolicited pushes, and peer-to-peer
//! signals. Calls hold a reference to the channel to send; the channel
//! holds weak references to calls to route.

pub mod batch;
pub mod frames;
pub mod request;
pub mod routing;
pub mod signals;

use crate::calls::Call;
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::{Connected, Disconnected, EventBus, Reconnected};
use batch::Batcher;
use log::{debug, info, warn};
use request::RpcError;
use routing::SignalingDelegate;
use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::{Duration, sleep};

/// Initial reconnect backoff.
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(2_500);
/// Backoff cap; once reached the delay stays here.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(300);

/// How this client authenticates before the duplex session opens.
#[derive(Debug, Clone)]
pub enum AuthParams {
    /// Development mode: mint a token directly from the app secret.
    AppSecret {
        app_id: String,
        endpoint_id: String,
        ttl_secs: u64,
    },
    /// Production: a token brokered by the application's own server.
    TokenId { token_id: String },
}

/// Static channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL of the cloud API, e.g. `https://api.respoke.io`.
    pub base_url: String,
    /// Value of the `Respoke-SDK` header sent on every frame.
    pub sdk_header: String,
    /// Timeout applied to every RPC awaiting its response frame.
    pub request_timeout: Duration,
    /// Whether call-debug reports are posted. Off by default.
    pub debug_reports: bool,
    /// Whether the channel schedules reconnects after a drop.
    pub reconnect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.respoke.io".to_string(),
            sdk_header: format!("respoke-rust/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            debug_reports: false,
            reconnect: true,
        }
    }
}

type PendingSender = oneshot::Sender<Result<request::RawResponse, RpcError>>;

pub struct SignalingChannel {
    pub(crate) config: ChannelConfig,
    http: Arc<dyn HttpClient>,
    transport_factory: Arc<dyn TransportFactory>,
    pub(crate) bus: Arc<EventBus>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    connected: AtomicBool,
    expected_disconnect: AtomicBool,
    /// Session token presented in the `App-Token` header.
    app_token: RwLock<Option<String>>,
    auth: RwLock<Option<AuthParams>>,
    endpoint_id: RwLock<Option<String>>,
    connection_id: RwLock<Option<String>>,

    // Request multiplexing
    pub(crate) pending: Mutex<HashMap<u64, PendingSender>>,
    id_counter: AtomicU64,
    /// Bumped on every session establish so stale read loops from a dead
    /// transport cannot tear down its successor.
    session_generation: AtomicU64,

    // Signal routing
    pub(crate) calls: RwLock<HashMap<String, Weak<Call>>>,
    pub(crate) delegate: RwLock<Option<Weak<dyn SignalingDelegate>>>,

    // Batched membership operations
    pub(crate) join_batch: Batcher,
    pub(crate) leave_batch: Batcher,
    pub(crate) presence_batch: Batcher,
    pub(crate) registered_presence: StdMutex<HashSet<String>>,

    // Reconnection
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,

    pub(crate) turn_cache: RwLock<Option<signals::CachedTurnCredentials>>,
}

impl SignalingChannel {
    pub fn new(
        config: ChannelConfig,
        http: Arc<dyn HttpClient>,
        transport_factory: Arc<dyn TransportFactory>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            http,
            transport_factory,
            bus,
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            app_token: RwLock::new(None),
            auth: RwLock::new(None),
            endpoint_id: RwLock::new(None),
            connection_id: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
            session_generation: AtomicU64::new(0),
            calls: RwLock::new(HashMap::new()),
            delegate: RwLock::new(None),
            join_batch: Batcher::new("join"),
            leave_batch: Batcher::new("leave"),
            presence_batch: Batcher::new("presence"),
            registered_presence: StdMutex::new(HashSet::new()),
            reconnecting: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            turn_cache: RwLock::new(None),
        })
    }

    /// Install the owning client. The channel only ever holds it weakly.
    pub async fn set_delegate(&self, delegate: Weak<dyn SignalingDelegate>) {
        *self.delegate.write().await = Some(delegate);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn endpoint_id(&self) -> Option<String> {
        self.endpoint_id.read().await.clone()
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.connection_id.read().await.clone()
    }

    /// Next monotonic request id, unique within this process.
    pub(crate) fn next_request_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Authenticate over HTTP, obtain a session token, and open the
    /// duplex session.
    pub async fn open(self: &Arc<Self>, auth: AuthParams) -> Result<(), RpcError> {
        *self.auth.write().await = Some(auth);
        self.expected_disconnect.store(false, Ordering::Relaxed);
        self.connect_session().await?;

        let endpoint_id = self.endpoint_id().await.unwrap_or_default();
        let connection_id = self.connection_id().await.unwrap_or_default();
        EventBus::emit(
            &self.bus.connected,
            Arc::new(Connected {
                endpoint_id,
                connection_id,
            }),
        );
        Ok(())
    }

    /// Best-effort deregister, invalidate the session token, and close
    /// the transport. Pending requests are rejected.
    pub async fn close(self: &Arc<Self>) {
        self.expected_disconnect.store(true, Ordering::Relaxed);

        if self.is_connected() {
            if let Err(e) = self
                .request(Method::Delete, "/v1/connections", None)
                .await
            {
                debug!(target: "Signaling", "Deregister on close failed: {e}");
            }
        }

        if let Some(token) = self.app_token.read().await.clone() {
            let req = HttpRequest {
                method: Method::Delete,
                url: format!("{}/v1/session-tokens", self.config.base_url),
                headers: self.http_headers(Some(&token)),
                body: None,
            };
            if let Err(e) = self.http.execute(req).await {
                debug!(target: "Signaling", "Session token invalidation failed: {e}");
            }
        }

        self.teardown_transport().await;
        self.fail_pending(|| RpcError::Disconnected).await;
        *self.app_token.write().await = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Acquire a session token and bring the transport up. Shared between
    /// the initial open and every reconnect attempt.
    async fn connect_session(self: &Arc<Self>) -> Result<(), RpcError> {
        let auth = self
            .auth
            .read()
            .await
            .clone()
            .ok_or_else(|| RpcError::Auth("no credentials configured".to_string()))?;

        let token_id = match auth {
            AuthParams::AppSecret {
                app_id,
                endpoint_id,
                ttl_secs,
            } => {
                let body = serde_json::json!({
                    "appId": app_id,
                    "endpointId": endpoint_id.clone(),
                    "ttl": ttl_secs,
                });
                let response = self
                    .http_post("/v1/tokens", body)
                    .await
                    .map_err(|e| RpcError::Network(e.to_string()))?;
                *self.endpoint_id.write().await = Some(endpoint_id);
                Self::auth_field(&response, "tokenId")?
            }
            AuthParams::TokenId { token_id } => token_id,
        };

        let response = self
            .http_post("/v1/session-tokens", serde_json::json!({ "tokenId": token_id }))
            .await
            .map_err(|e| RpcError::Network(e.to_string()))?;
        let token = Self::auth_field(&response, "token")?;
        if let Some(body) = response.json() {
            if let Some(endpoint) = body.get("endpointId").and_then(|v| v.as_str()) {
                *self.endpoint_id.write().await = Some(endpoint.to_string());
            }
            if let Some(connection) = body.get("connectionId").and_then(|v| v.as_str()) {
                *self.connection_id.write().await = Some(connection.to_string());
            }
        }
        *self.app_token.write().await = Some(token.clone());

        let (transport, events) = self
            .transport_factory
            .create_transport(&token)
            .await
            .map_err(|e| RpcError::Network(e.to_string()))?;
        *self.transport.lock().await = Some(transport);
        self.connected.store(true, Ordering::Relaxed);
        let generation = self.session_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_read_loop(events, generation);

        info!(target: "Signaling", "Duplex session established");
        Ok(())
    }

    fn auth_field(response: &HttpResponse, field: &str) -> Result<String, RpcError> {
        if !(200..300).contains(&response.status_code) {
            let message = response
                .json()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| format!("token endpoint returned {}", response.status_code));
            return Err(RpcError::Auth(message));
        }
        response
            .json()
            .and_then(|v| v.get(field).and_then(|t| t.as_str()).map(String::from))
            .ok_or_else(|| RpcError::Auth(format!("token response missing `{field}`")))
    }

    async fn http_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<HttpResponse> {
        let token = self.app_token.read().await.clone();
        self.http
            .execute(HttpRequest {
                method: Method::Post,
                url: format!("{}{}", self.config.base_url, path),
                headers: self.http_headers(token.as_deref()),
                body: Some(body),
            })
            .await
    }

    pub(crate) fn http_headers(&self, token: Option<&str>) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Respoke-SDK".to_string(), self.config.sdk_header.clone()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if let Some(token) = token {
            headers.push(("App-Token".to_string(), token.to_string()));
        }
        headers
    }

    pub(crate) fn frame_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Respoke-SDK".to_string(), self.config.sdk_header.clone());
        if let Ok(guard) = self.app_token.try_read() {
            if let Some(token) = guard.as_ref() {
                headers.insert("App-Token".to_string(), token.clone());
            }
        }
        headers
    }

    pub(crate) async fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().await.clone()
    }

    async fn teardown_transport(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
    }

    fn spawn_read_loop(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>, generation: u64) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Frame(frame)) => {
                        channel.handle_frame(&frame).await;
                    }
                    Some(TransportEvent::Disconnected { reason }) => {
                        channel.handle_disconnect(generation, reason).await;
                        return;
                    }
                    None => {
                        channel.handle_disconnect(generation, None).await;
                        return;
                    }
                }
            }
        });
    }

    /// The transport dropped out from under us. Reject everything pending
    /// and schedule a reconnect when allowed.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        if generation != self.session_generation.load(Ordering::SeqCst) {
            debug!(target: "Signaling", "Ignoring disconnect from a stale session");
            return;
        }
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.transport.lock().await = None;
        self.fail_pending(|| RpcError::Disconnected).await;

        let expected = self.expected_disconnect.load(Ordering::Relaxed);
        if expected {
            info!(target: "Signaling", "Session closed as expected.");
            return;
        }

        warn!(target: "Signaling", "Session disconnected unexpectedly: {reason:?}");
        EventBus::emit(
            &self.bus.disconnected,
            Arc::new(Disconnected { reason }),
        );

        if self.config.reconnect {
            self.spawn_reconnect();
        }
    }

    pub(crate) async fn fail_pending(&self, error: impl Fn() -> RpcError) {
        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(error()));
        }
    }

    /// Kick off the reconnect loop. Re-entrancy guarded: a second caller
    /// while an attempt is in flight is a no-op, and the guard clears on
    /// every exit path so a failure never disables future reconnects.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(target: "Signaling", "Reconnect already in flight.");
            return;
        }

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = scopeguard::guard((), |_| {
                channel_guard_clear(&channel);
            });

            loop {
                let attempt = channel.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                let delay = reconnect_delay(attempt);
                info!(
                    target: "Signaling",
                    "Reconnecting in {:?} (attempt {})",
                    delay,
                    attempt + 1
                );
                sleep(delay).await;

                if channel.expected_disconnect.load(Ordering::Relaxed) {
                    return;
                }

                match channel.connect_session().await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(target: "Signaling", "Reconnect attempt failed: {e}");
                        continue;
                    }
                }

                // The client re-registers its groups; a rejoin failure
                // counts as a failed reconnect and the loop continues.
                let rejoin = {
                    let delegate = channel.delegate.read().await.clone();
                    match delegate.and_then(|d| d.upgrade()) {
                        Some(delegate) => delegate.on_reconnect_established().await,
                        None => Ok(()),
                    }
                };
                if let Err(e) = rejoin {
                    warn!(target: "Signaling", "Group rejoin after reconnect failed: {e}");
                    channel.teardown_transport().await;
                    channel.connected.store(false, Ordering::Relaxed);
                    continue;
                }

                let attempts = channel.reconnect_attempts.swap(0, Ordering::SeqCst);
                info!(target: "Signaling", "Reconnected after {attempts} attempt(s)");
                EventBus::emit(
                    &channel.bus.reconnected,
                    Arc::new(Reconnected { attempts }),
                );
                return;
            }
        });
    }

    /// Whether the owning client has an incoming-call listener.
    pub(crate) async fn delegate_listening(&self) -> bool {
        self.delegate
            .read()
            .await
            .clone()
            .and_then(|d| d.upgrade())
            .map(|d| d.is_listening_for_calls())
            .unwrap_or(false)
    }

    /// Register a call for signal routing. Held weakly; a dropped call is
    /// pruned on the next routing miss.
    pub async fn register_call(&self, session_id: &str, call: &Arc<Call>) {
        self.calls
            .write()
            .await
            .insert(session_id.to_string(), Arc::downgrade(call));
    }

    pub async fn unregister_call(&self, session_id: &str) {
        self.calls.write().await.remove(session_id);
    }
}

fn channel_guard_clear(channel: &SignalingChannel) {
    channel.reconnecting.store(false, Ordering::SeqCst);
}

fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(8);
    RECONNECT_BASE_DELAY
        .saturating_mul(factor as u32)
        .min(RECONNECT_MAX_DELAY)
}
