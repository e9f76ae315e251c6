//! Swarm Peers - Liveness registry and coordinator election
//!
//! Every node learns about the others purely from their heartbeats. A peer is
//! created on the first heartbeat from an unknown id, refreshed on every later
//! one, and forgotten once it has been silent for longer than the liveness
//! timeout.
//!
//! # Election
//!
//! There is no voting round. Each node independently computes
//!
//! ```text
//! coordinator = min(self_id, { p.id | p alive })
//! ```
//!
//! and re-runs that computation synchronously on every membership change.
//! Nodes with the same view of the alive set agree on the coordinator without
//! exchanging a single extra message.

mod peer;
mod registry;

pub use peer::{Peer, Role};
pub use registry::{Election, PeerRegistry, Prune, DEFAULT_PEER_TIMEOUT_MS};
