//! Transport seam between the engine and the network.
//!
//! The engine only ever broadcasts. Inbound datagrams and membership signals
//! are pushed in by the host through `Engine::receive` and
//! `Engine::on_membership`, so a transport implementation is just an id and a
//! way to put bytes on the wire.

use swarm_proto::NodeId;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Outbound half of a mesh transport.
pub trait Transport {
    /// Stable id of this node on the mesh.
    fn self_id(&self) -> NodeId;

    /// Best-effort broadcast to every reachable peer. No ordering or delivery
    /// guarantee.
    fn send_broadcast(&mut self, bytes: Vec<u8>) -> Result<()>;
}

/// Membership signal raised by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A direct connection to `id` came up.
    Joined(NodeId),
    /// The connection to `id` went away.
    Dropped(NodeId),
    /// The mesh rearranged itself without a specific join or drop.
    TopologyChanged,
}

/// Transport that hands outbound frames to a channel.
///
/// Used by the service driver: the engine stays synchronous and a separate
/// task drains the receiver onto the real socket.
#[derive(Debug, Clone)]
pub struct Outbox {
    self_id: NodeId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbox {
    pub fn new(self_id: NodeId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { self_id, tx }, rx)
    }
}

impl Transport for Outbox {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn send_broadcast(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(bytes).map_err(|_| Error::ServiceClosed)
    }
}
