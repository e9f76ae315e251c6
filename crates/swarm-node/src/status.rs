//! Point-in-time view of a node, handed to hooks and to the host.

use serde::Serialize;
use swarm_peers::Role;
use swarm_proto::NodeId;

/// Owned snapshot of the engine's headline numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    pub coordinator: NodeId,
    pub uptime_secs: u64,
    /// Alive peers, not counting this node.
    pub peer_count: usize,
    pub state_count: usize,
    pub heap_free: u64,
}

impl NodeStatus {
    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) role={} coord={} peers={} states={} up={}s",
            self.name,
            self.id,
            self.role,
            self.coordinator,
            self.peer_count,
            self.state_count,
            self.uptime_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_json() {
        let status = NodeStatus {
            id: 42,
            name: "N2A".to_string(),
            role: Role::Coordinator,
            coordinator: 42,
            uptime_secs: 3,
            peer_count: 2,
            state_count: 5,
            heap_free: 0,
        };

        assert!(status.is_coordinator());
        assert_eq!(
            status.to_string(),
            "N2A (42) role=COORD coord=42 peers=2 states=5 up=3s"
        );

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["role"], "Coordinator");
        assert_eq!(json["peer_count"], 2);
    }
}
