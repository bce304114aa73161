//! Transport abstraction for the duplex session.
//!
//! The transport moves opaque frames; framing semantics (requests,
//! responses, pushes) live in the signaling layer. An implementation is
//! expected to deliver frames ordered and at least once.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events surfaced by a live transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One inbound frame.
    Frame(bytes::Bytes),
    /// The transport went away; the reason is best-effort.
    Disconnected { reason: Option<String> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error>;

    async fn disconnect(&self);
}

/// Creates transports. A fresh transport is requested for the initial
/// connect and for every reconnect attempt, authenticated by the current
/// session token.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        session_token: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// A transport that swallows frames, for tests that never read them.
    pub struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _data: &[u8]) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[derive(Default)]
    pub struct NullTransportFactory;

    #[async_trait]
    impl TransportFactory for NullTransportFactory {
        async fn create_transport(
            &self,
            _session_token: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let (_tx, rx) = mpsc::channel(1);
            Ok((Arc::new(NullTransport), rx))
        }
    }
}
