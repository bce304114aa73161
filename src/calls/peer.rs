//! Peer-connection abstraction.
//!
//! The peer connection is a platform primitive: it produces offers,
//! answers, and candidates, opens data channels, and reports stats. The
//! core drives it through this seam and never links a WebRTC stack itself.

use crate::types::signal::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events a live peer connection pushes at the owning call.
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    /// A locally gathered candidate ready to relay to the remote side.
    IceCandidate(IceCandidate),
    /// Remote media started arriving.
    RemoteMediaReceived,
    /// Local media finished gathering.
    LocalMediaReceived,
    /// A data channel reached the open state.
    DirectConnectionOpen,
    /// A message arrived on the data channel.
    DirectConnectionMessage(serde_json::Value),
    /// The data channel closed.
    DirectConnectionClose,
    /// Periodic statistics report.
    Stats(serde_json::Value),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    /// Produce an answer to the given remote offer.
    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> anyhow::Result<SessionDescription>;

    async fn set_remote_description(&self, description: &SessionDescription)
    -> anyhow::Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()>;

    async fn create_data_channel(&self, label: &str) -> anyhow::Result<Arc<dyn DataChannel>>;

    async fn get_stats(&self) -> anyhow::Result<serde_json::Value>;

    async fn close(&self);
}

/// A data channel riding on a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, message: &serde_json::Value) -> anyhow::Result<()>;

    async fn close(&self);
}

/// Builds peer connections for calls. Supplied by the application, one
/// per call.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
    ) -> anyhow::Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerConnectionEvent>)>;
}
