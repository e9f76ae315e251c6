//! Peer registry with lowest-id election.

use std::collections::BTreeMap;

use swarm_proto::{Millis, NodeId};
use tracing::{debug, trace};

use crate::peer::{Peer, Role};

/// Default liveness timeout: a peer silent for longer than this is pruned.
pub const DEFAULT_PEER_TIMEOUT_MS: Millis = 15_000;

/// Result of an election pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Election {
    /// Lowest alive node id, possibly our own.
    pub coordinator: NodeId,
    /// Our role before this pass.
    pub previous: Role,
    /// Our role after this pass.
    pub current: Role,
}

impl Election {
    /// Whether our own role flipped.
    pub fn role_changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Result of a prune sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prune {
    /// Peers removed by this sweep, in ascending id order.
    pub removed: Vec<NodeId>,
    /// Election outcome, present only if something was removed.
    pub election: Option<Election>,
}

/// Known peers of one node, plus the current election result.
///
/// All mutation goes through `&mut self`; the registry is owned by a single
/// engine and never shared.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: NodeId,
    peers: BTreeMap<NodeId, Peer>,
    coordinator: NodeId,
    role: Role,
}

impl PeerRegistry {
    /// Create a registry for `self_id`. With no peers, we are the coordinator.
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            peers: BTreeMap::new(),
            coordinator: self_id,
            role: Role::Coordinator,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Upsert a peer from its heartbeat and re-run the election.
    ///
    /// Heartbeats carrying our own id (our broadcast echoed back) are ignored
    /// and return `None`.
    pub fn record_heartbeat(
        &mut self,
        id: NodeId,
        name: &str,
        role: &str,
        now: Millis,
    ) -> Option<Election> {
        if id == self.self_id {
            trace!(id, "Ignoring own heartbeat");
            return None;
        }

        match self.peers.get_mut(&id) {
            Some(peer) => {
                if !peer.alive {
                    debug!(id, name, "Peer reinstated");
                }
                peer.name.clear();
                peer.name.push_str(name);
                peer.role.clear();
                peer.role.push_str(role);
                peer.last_seen = now;
                peer.alive = true;
            }
            None => {
                debug!(id, name, role, "New peer");
                self.peers.insert(id, Peer::new(id, name, role, now));
            }
        }

        Some(self.elect_coordinator())
    }

    /// Mark a peer dropped on a transport disconnect signal.
    ///
    /// The entry is kept so a peer that reconnects before the timeout is
    /// reinstated by its next heartbeat; only [`prune_stale`](Self::prune_stale)
    /// removes entries.
    pub fn mark_dropped(&mut self, id: NodeId) -> Election {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.alive = false;
            debug!(id, "Peer marked dropped");
        }
        self.elect_coordinator()
    }

    /// Remove every peer silent for longer than `timeout`.
    pub fn prune_stale(&mut self, now: Millis, timeout: Millis) -> Prune {
        let removed: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| p.is_stale(now, timeout))
            .map(|p| p.id)
            .collect();

        if removed.is_empty() {
            return Prune {
                removed,
                election: None,
            };
        }

        for id in &removed {
            self.peers.remove(id);
        }
        debug!(removed = ?removed, remaining = self.peers.len(), "Pruned stale peers");

        Prune {
            removed,
            election: Some(self.elect_coordinator()),
        }
    }

    /// Recompute `min(self_id, alive ids)` and store the result.
    pub fn elect_coordinator(&mut self) -> Election {
        // BTreeMap iterates in ascending id order, so the first alive peer is the minimum.
        let lowest_alive = self.peers.values().find(|p| p.alive).map(|p| p.id);
        let coordinator = lowest_alive.map_or(self.self_id, |id| id.min(self.self_id));

        let previous = self.role;
        self.coordinator = coordinator;
        self.role = if coordinator == self.self_id {
            Role::Coordinator
        } else {
            Role::Peer
        };

        Election {
            coordinator,
            previous,
            current: self.role,
        }
    }

    pub fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    /// Number of alive peers (excludes ourselves and dropped entries).
    pub fn peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.alive).count()
    }

    pub fn get(&self, id: NodeId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Owned copy of every known peer, ascending by id.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }
}
