//! RPC request/response multiplexing over the duplex session.

use super::SignalingChannel;
use super::frames::{BODY_SIZE_LIMIT, InboundFrame, RequestFrame};
use crate::http::Method;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep, timeout};

/// Delay between attempts after a 429.
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);
/// Retries allowed after the first 429 before the error propagates.
const RATE_LIMIT_RETRIES: u32 = 3;

/// Statuses handed back to the caller as a resolved response.
const PASSTHROUGH_STATUSES: [u16; 8] = [200, 204, 205, 302, 401, 403, 404, 418];

/// Errors surfaced by channel RPCs.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    /// 401 whose body names a billing suspension. Distinct from the
    /// general case so callers can route the user to billing remediation.
    #[error("account suspended for billing: {0}")]
    BillingSuspension(String),
    #[error("account suspended: {0}")]
    Suspension(String),
    /// The duplex session is not connected, or dropped while the request
    /// was in flight.
    #[error("signaling channel is not connected")]
    Disconnected,
    #[error("request body is {size} bytes, over the {limit}-byte limit")]
    OverLimit { size: usize, limit: usize },
    #[error("rate limited; gave up after {tries} attempts")]
    RateLimited { tries: u32 },
    #[error("could not parse response body")]
    Parse,
    #[error("request timed out")]
    Timeout,
    /// A wrapper was handed a field set it cannot send.
    #[error("invalid request: {0}")]
    InvalidArgument(String),
    #[error("server returned {code}: {message}")]
    Server { code: u16, message: String },
}

/// Raw response as carried on the wire, before body normalization.
#[derive(Debug, Clone)]
pub(crate) struct RawResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

/// A resolved RPC response.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl SignalingChannel {
    /// Issue one RPC over the duplex session and await its response
    /// frame. Handles the rate-limit retry loop, the client-side body
    /// limit, and the suspension taxonomy.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        data: Option<serde_json::Value>,
    ) -> Result<RpcResponse, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::Disconnected);
        }

        if let Some(body) = &data {
            let size = serde_json::to_string(body).map_err(|_| RpcError::Parse)?.len();
            if size > BODY_SIZE_LIMIT {
                return Err(RpcError::OverLimit {
                    size,
                    limit: BODY_SIZE_LIMIT,
                });
            }
        }

        let request_id = self.next_request_id();
        let mut tries: u32 = 0;
        loop {
            tries += 1;
            let frame = RequestFrame {
                id: request_id,
                method,
                path: path.to_string(),
                headers: self.frame_headers(),
                data: data.clone(),
            };

            let raw = self.submit(frame).await?;
            let body = normalize_body(raw.body)?;

            if raw.status_code == 429 {
                if tries > RATE_LIMIT_RETRIES {
                    debug!(
                        target: "Signaling/Rpc",
                        "{} {} rate limited after {} attempts", method, path, tries
                    );
                    return Err(RpcError::RateLimited { tries });
                }
                sleep(RATE_LIMIT_DELAY).await;
                continue;
            }

            if raw.status_code == 401 {
                if let Some(suspension) = suspension_error(&body) {
                    return Err(suspension);
                }
            }

            if PASSTHROUGH_STATUSES.contains(&raw.status_code) {
                return Ok(RpcResponse {
                    status_code: raw.status_code,
                    body,
                });
            }

            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("received {} response", raw.status_code));
            return Err(RpcError::Server {
                code: raw.status_code,
                message,
            });
        }
    }

    /// Register a pending completion, put the frame on the wire, and wait
    /// for exactly one response.
    async fn submit(&self, frame: RequestFrame) -> Result<RawResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(frame.id, tx);

        let transport = match self.current_transport().await {
            Some(t) => t,
            None => {
                self.pending.lock().await.remove(&frame.id);
                return Err(RpcError::Disconnected);
            }
        };

        let payload = serde_json::to_vec(&frame).map_err(|_| RpcError::Parse)?;
        debug!(
            target: "Signaling/Send",
            "[{}] {} {}", frame.id, frame.method, frame.path
        );
        if let Err(e) = transport.send(&payload).await {
            self.pending.lock().await.remove(&frame.id);
            warn!(target: "Signaling/Send", "Frame send failed: {e}");
            return Err(RpcError::Disconnected);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // The sender vanished without a verdict; the map was dropped.
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&frame.id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Entry point for every inbound frame from the transport read loop.
    pub(crate) async fn handle_frame(self: &std::sync::Arc<Self>, raw: &[u8]) {
        let frame: InboundFrame = match serde_json::from_slice(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Signaling/Recv", "Undecodable frame: {e}");
                return;
            }
        };

        match frame {
            InboundFrame::Response {
                id,
                status_code,
                body,
            } => {
                self.resolve_pending(id, RawResponse { status_code, body }).await;
            }
            other => self.handle_push(other).await,
        }
    }

    async fn resolve_pending(&self, id: u64, response: RawResponse) {
        debug!(
            target: "Signaling/Recv",
            "[{}] response {}", id, response.status_code
        );
        match self.pending.lock().await.remove(&id) {
            Some(waiter) => {
                if waiter.send(Ok(response)).is_err() {
                    warn!(
                        target: "Signaling/Recv",
                        "Response waiter for request {id} was dropped"
                    );
                }
            }
            None => {
                warn!(
                    target: "Signaling/Recv",
                    "Response for unknown request id {id}"
                );
            }
        }
    }
}

/// Response bodies may arrive structured or as a JSON string. A string
/// that does not parse is a protocol error.
fn normalize_body(body: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    match body {
        serde_json::Value::String(text) => {
            if text.is_empty() {
                Ok(serde_json::Value::Null)
            } else {
                serde_json::from_str(&text).map_err(|_| RpcError::Parse)
            }
        }
        structured => Ok(structured),
    }
}

/// Inspect a 401 body for the account-suspension markers.
fn suspension_error(body: &serde_json::Value) -> Option<RpcError> {
    let details = body.get("details")?;

    if let Some(reason) = details.get("reason").and_then(|r| r.as_str()) {
        if reason.contains("billing suspension") {
            return Some(RpcError::BillingSuspension(reason.to_string()));
        }
    }
    if let Some(message) = details.get("message").and_then(|m| m.as_str()) {
        if message.contains("suspended") {
            return Some(RpcError::Suspension(message.to_string()));
        }
    }
    None
}
