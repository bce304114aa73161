//! Shared test doubles: an in-memory transport that loops responses back,
//! a canned HTTP client for token acquisition, and a scripted peer
//! connection.
#![allow(dead_code)]

use async_trait::async_trait;
use respoke::calls::peer::{
    DataChannel, PeerConnection, PeerConnectionEvent, PeerConnectionFactory,
};
use respoke::client::Client;
use respoke::http::{HttpClient, HttpRequest, HttpResponse};
use respoke::signaling::{AuthParams, ChannelConfig};
use respoke::transport::{Transport, TransportEvent, TransportFactory};
use respoke::types::signal::{IceCandidate, SessionDescription};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Decides the response frame for one captured request frame. Returning
/// `None` leaves the request hanging.
pub type Responder = Box<dyn FnMut(&Value) -> Option<Value> + Send>;

/// Respond to everything with the given status and body.
pub fn respond_with(status: u16, body: Value) -> Responder {
    Box::new(move |frame| {
        Some(json!({
            "type": "response",
            "id": frame["id"].clone(),
            "statusCode": status,
            "body": body.clone(),
        }))
    })
}

pub fn ok_responder() -> Responder {
    respond_with(200, json!({}))
}

pub struct TestHarness {
    /// Every request frame sent over every transport, in order.
    pub sent: Arc<Mutex<Vec<Value>>>,
    pub responder: Arc<Mutex<Responder>>,
    /// Event sender into the most recently created transport.
    pub event_tx: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
    pub connect_count: Arc<AtomicUsize>,
}

impl TestHarness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(ok_responder())),
            event_tx: Arc::new(Mutex::new(None)),
            connect_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap() = responder;
    }

    /// Frames sent to a given path.
    pub fn sent_to(&self, path: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f["path"] == path)
            .cloned()
            .collect()
    }

    /// Push one inbound frame at the client, as the server would.
    pub async fn inject(&self, frame: Value) {
        let tx = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no live transport");
        tx.send(TransportEvent::Frame(bytes::Bytes::from(
            serde_json::to_vec(&frame).unwrap(),
        )))
        .await
        .unwrap();
    }

    /// Deliver a signal push wrapping the given signal object.
    pub async fn inject_signal(&self, signal: Value) {
        self.inject(json!({
            "type": "signal",
            "body": signal.to_string(),
        }))
        .await;
    }

    /// Kill the live transport out from under the channel.
    pub async fn drop_transport(&self) {
        let tx = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no live transport");
        tx.send(TransportEvent::Disconnected {
            reason: Some("test drop".to_string()),
        })
        .await
        .unwrap();
    }
}

struct HarnessTransport {
    harness: Arc<TestHarness>,
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for HarnessTransport {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        let frame: Value = serde_json::from_slice(data)?;
        self.harness.sent.lock().unwrap().push(frame.clone());
        let response = (self.harness.responder.lock().unwrap())(&frame);
        if let Some(response) = response {
            let _ = self
                .events
                .send(TransportEvent::Frame(bytes::Bytes::from(
                    serde_json::to_vec(&response)?,
                )))
                .await;
        }
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[async_trait]
impl TransportFactory for TestHarness {
    async fn create_transport(
        &self,
        _session_token: &str,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.event_tx.lock().unwrap() = Some(tx.clone());
        let harness = TestHarness {
            sent: self.sent.clone(),
            responder: self.responder.clone(),
            event_tx: self.event_tx.clone(),
            connect_count: self.connect_count.clone(),
        };
        let transport = HarnessTransport {
            harness: Arc::new(harness),
            events: tx,
        };
        Ok((Arc::new(transport), rx))
    }
}

/// HTTP double answering the token endpoints.
pub struct TokenHttpClient;

#[async_trait]
impl HttpClient for TokenHttpClient {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let body = if request.url.ends_with("/v1/tokens") {
            json!({"tokenId": "token-id-1"})
        } else if request.url.ends_with("/v1/session-tokens") {
            json!({
                "token": "app-token-1",
                "endpointId": "alice",
                "connectionId": "conn-self",
            })
        } else {
            json!({})
        };
        Ok(HttpResponse {
            status_code: 200,
            body: serde_json::to_vec(&body).unwrap(),
        })
    }
}

pub struct MockDataChannel;

#[async_trait]
impl DataChannel for MockDataChannel {
    async fn send(&self, _message: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

pub struct MockPeerConnection;

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(
        &self,
        _remote: &SessionDescription,
    ) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(&self, _description: &SessionDescription) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_data_channel(&self, _label: &str) -> anyhow::Result<Arc<dyn DataChannel>> {
        Ok(Arc::new(MockDataChannel))
    }

    async fn get_stats(&self) -> anyhow::Result<Value> {
        Ok(json!({}))
    }

    async fn close(&self) {}
}

/// Factory that hands out mock peer connections and keeps every event
/// sender so tests can drive media events.
pub struct MockPeerConnectionFactory {
    pub event_senders: Arc<Mutex<Vec<mpsc::Sender<PeerConnectionEvent>>>>,
}

impl MockPeerConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            event_senders: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn latest_events(&self) -> mpsc::Sender<PeerConnectionEvent> {
        self.event_senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection created yet")
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerConnectionFactory {
    async fn create_peer_connection(
        &self,
    ) -> anyhow::Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerConnectionEvent>)> {
        let (tx, rx) = mpsc::channel(64);
        self.event_senders.lock().unwrap().push(tx);
        Ok((Arc::new(MockPeerConnection), rx))
    }
}

/// A connected client wired to the harness. Every integration test
/// starts here, so logging comes up with the first client.
pub async fn connected_client() -> (Arc<Client>, Arc<TestHarness>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = TestHarness::new();
    let client = Client::new(
        ChannelConfig::default(),
        Arc::new(TokenHttpClient),
        harness.clone(),
    );
    client
        .connect(AuthParams::AppSecret {
            app_id: "app-1".to_string(),
            endpoint_id: "alice".to_string(),
            ttl_secs: 86_400,
        })
        .await
        .expect("connect failed");
    (client, harness)
}

/// Let spawned tasks and timers run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
