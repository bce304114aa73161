//! Presence values and resolution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Presence reported by a single connection.
///
/// Ordering encodes resolution priority: when an endpoint has several live
/// connections its resolved presence is the highest-priority value among
/// them, `chat` first, `unavailable` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Chat,
    Available,
    Away,
    Dnd,
    Xa,
    Unavailable,
}

impl Presence {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Available => "available",
            Self::Away => "away",
            Self::Dnd => "dnd",
            Self::Xa => "xa",
            Self::Unavailable => "unavailable",
        }
    }

    /// Parse a wire presence string; anything unrecognised resolves to
    /// `unavailable`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "chat" => Self::Chat,
            "available" => Self::Available,
            "away" => Self::Away,
            "dnd" => Self::Dnd,
            "xa" => Self::Xa,
            _ => Self::Unavailable,
        }
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::Unavailable
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve an endpoint's presence from its member connections.
pub fn resolve_presence(connections: impl IntoIterator<Item = Presence>) -> Presence {
    connections
        .into_iter()
        .min()
        .unwrap_or(Presence::Unavailable)
}
