//! Direct connections: peer-to-peer data-channel sessions.
//!
//! A direct connection is a special case of a call with
//! `target = directConnection`. It is owned by its call; the endpoint only
//! keeps the session id, cleared when the channel closes.

use super::Call;
use super::peer::DataChannel;
use crate::types::events::{DirectConnectionEvent, DirectConnectionEventKind, EventBus};
use log::{debug, warn};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectConnectionError {
    #[error("data channel is not open")]
    NotOpen,
    #[error("data channel send failed: {0}")]
    Send(#[from] anyhow::Error),
}

pub struct DirectConnection {
    session_id: String,
    remote_endpoint: String,
    call: Weak<Call>,
    data_channel: StdMutex<Option<Arc<dyn DataChannel>>>,
    bus: Arc<EventBus>,
}

impl DirectConnection {
    pub(crate) fn new(call: &Arc<Call>, bus: Arc<EventBus>) -> Arc<Self> {
        let direct = Arc::new(Self {
            session_id: call.id().to_string(),
            remote_endpoint: call.remote_endpoint().to_string(),
            call: Arc::downgrade(call),
            data_channel: StdMutex::new(None),
            bus,
        });
        call.set_direct_connection(direct.clone());
        direct.emit(DirectConnectionEventKind::Start);
        direct
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    pub fn call(&self) -> Option<Arc<Call>> {
        self.call.upgrade()
    }

    pub fn is_open(&self) -> bool {
        self.data_channel.lock().unwrap().is_some()
    }

    /// Accept an inbound direct connection: open the local half of the
    /// data channel on the call's peer connection.
    pub async fn accept(self: &Arc<Self>) -> Result<(), DirectConnectionError> {
        self.emit(DirectConnectionEventKind::Accept);
        let Some(call) = self.call.upgrade() else {
            return Err(DirectConnectionError::NotOpen);
        };
        let pc = call.pc_handle().await.ok_or(DirectConnectionError::NotOpen)?;
        let data_channel = pc
            .create_data_channel(&self.session_id)
            .await
            .map_err(DirectConnectionError::Send)?;
        *self.data_channel.lock().unwrap() = Some(data_channel);
        Ok(())
    }

    /// Send one message over the open data channel.
    pub async fn send(&self, message: serde_json::Value) -> Result<(), DirectConnectionError> {
        let data_channel = self
            .data_channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(DirectConnectionError::NotOpen)?;
        data_channel.send(&message).await?;
        Ok(())
    }

    /// Close the data channel and hang up the owning call.
    pub async fn close(self: &Arc<Self>) {
        let data_channel = self.data_channel.lock().unwrap().take();
        if let Some(data_channel) = data_channel {
            data_channel.close().await;
        }
        if let Some(call) = self.call.upgrade()
            && let Err(e) = call.hangup(true).await
        {
            warn!(
                target: "DirectConnection",
                "Hangup after close failed for {}: {e}", self.session_id
            );
            self.notify_error(e.to_string());
        }
        self.notify_close();
    }

    pub(crate) fn set_data_channel(&self, data_channel: Arc<dyn DataChannel>) {
        *self.data_channel.lock().unwrap() = Some(data_channel);
    }

    pub(crate) fn notify_open(&self) {
        debug!(target: "DirectConnection", "{} open", self.session_id);
        self.emit(DirectConnectionEventKind::Open);
    }

    pub(crate) fn notify_message(&self, message: serde_json::Value) {
        self.emit(DirectConnectionEventKind::Message(message));
    }

    pub(crate) fn notify_close(&self) {
        self.emit(DirectConnectionEventKind::Close);
    }

    pub(crate) fn notify_error(&self, error: impl Into<String>) {
        self.emit(DirectConnectionEventKind::Error(error.into()));
    }

    fn emit(&self, kind: DirectConnectionEventKind) {
        EventBus::emit(
            &self.bus.direct_connection,
            Arc::new(DirectConnectionEvent {
                session_id: self.session_id.clone(),
                remote_endpoint: self.remote_endpoint.clone(),
                kind,
            }),
        );
    }
}
