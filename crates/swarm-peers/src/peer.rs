//! Peer records and node roles.

use serde::{Deserialize, Serialize};
use swarm_proto::{Millis, NodeId};

/// Role of a node in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Peer,
    Coordinator,
}

impl Role {
    /// Role string carried in heartbeats.
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Peer => "PEER",
            Self::Coordinator => "COORD",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Another node, as last described by its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    /// Display name from the envelope sender field.
    pub name: String,
    /// Role the peer announced for itself. Informational only; election uses ids.
    pub role: String,
    /// Local clock reading when the last heartbeat arrived.
    pub last_seen: Millis,
    /// False only between a transport drop signal and the next prune or heartbeat.
    pub alive: bool,
}

impl Peer {
    pub fn new(id: NodeId, name: impl Into<String>, role: impl Into<String>, now: Millis) -> Self {
        Self {
            id,
            name: name.into(),
            role: role.into(),
            last_seen: now,
            alive: true,
        }
    }

    /// Milliseconds since the last heartbeat.
    pub fn silence(&self, now: Millis) -> Millis {
        now.saturating_sub(self.last_seen)
    }

    /// True once the peer has been silent for strictly longer than `timeout`.
    pub fn is_stale(&self, now: Millis, timeout: Millis) -> bool {
        self.silence(now) > timeout
    }
}
