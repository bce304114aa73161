//! Endpoints and connections.
//!
//! An endpoint is one logical user identity; each live session of that
//! identity is a connection with a server-issued id. The client owns the
//! endpoint index; endpoints hold call ids rather than call handles so the
//! ownership graph stays acyclic.

use super::presence::{Presence, resolve_presence};
use serde::{Deserialize, Serialize};

/// One live session of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub endpoint_id: String,
    #[serde(default)]
    pub presence: Presence,
}

/// One logical user, aggregating its live connections.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub id: String,
    pub connections: Vec<Connection>,
    /// Ids of calls involving this endpoint; the client maps ids to calls.
    pub call_ids: Vec<String>,
    /// Session id of this endpoint's direct connection, if one is open.
    /// At most one direct connection exists per endpoint.
    pub direct_connection_id: Option<String>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Presence of the whole endpoint, derived from member connections.
    pub fn resolved_presence(&self) -> Presence {
        resolve_presence(self.connections.iter().map(|c| c.presence))
    }

    pub fn connection(&self, connection_id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == connection_id)
    }

    /// Record a presence report from one connection, creating the
    /// connection entry if this is the first time it is seen.
    pub fn set_connection_presence(&mut self, connection_id: &str, presence: Presence) {
        match self.connections.iter_mut().find(|c| c.id == connection_id) {
            Some(conn) => conn.presence = presence,
            None => self.connections.push(Connection {
                id: connection_id.to_string(),
                endpoint_id: self.id.clone(),
                presence,
            }),
        }
    }

    /// Drop a connection that went away. Returns true when it was present.
    pub fn remove_connection(&mut self, connection_id: &str) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != connection_id);
        self.connections.len() < before
    }

    pub fn track_call(&mut self, call_id: &str) {
        if !self.call_ids.iter().any(|id| id == call_id) {
            self.call_ids.push(call_id.to_string());
        }
    }

    pub fn untrack_call(&mut self, call_id: &str) {
        self.call_ids.retain(|id| id != call_id);
    }
}
