//! Swarm Node - Engine, scheduler and runtime for a state-sync mesh node
//!
//! A node keeps a replica of a small shared key-value state in step with its
//! peers and agrees with them on a coordinator, over a broadcast transport that
//! may drop, duplicate or reorder anything.
//!
//! # Layers
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ swarm-node (bin)   UdpLink ◄──► SwarmService (tokio)  │
//! ├───────────────────────────────────────────────────────┤
//! │ Engine             tick / receive / set_local / hooks │
//! ├──────────────────────────┬────────────────────────────┤
//! │ swarm-peers              │ swarm-state                │
//! │ registry + election      │ versioned store + watchers │
//! ├──────────────────────────┴────────────────────────────┤
//! │ swarm-proto        JSON envelope codec                │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The [`Engine`] is synchronous and owns all node state; time comes from an
//! injected [`Clock`] and bytes leave through an injected [`Transport`]. The
//! [`SwarmService`] runs one engine on tokio, and [`sim`] runs many on an
//! in-memory bus.
//!
//! # Example
//!
//! ```
//! use swarm_node::sim::{SimCluster, SimNetwork};
//! use swarm_node::SwarmConfig;
//!
//! let mut cluster = SimCluster::new(SwarmConfig::default(), SimNetwork::new(7));
//! for id in [10, 20, 30] {
//!     cluster.add_node(id);
//! }
//! cluster.node_mut(20).unwrap().set_local("led", "on");
//! cluster.step(100);
//!
//! assert!(cluster.converged());
//! assert_eq!(cluster.coordinators().into_iter().collect::<Vec<_>>(), vec![10]);
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod schedule;
pub mod service;
pub mod sim;
pub mod status;
pub mod transport;
pub mod udp;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SwarmConfig;
pub use engine::{Engine, Inbound};
pub use error::{Error, Result};
pub use service::{Link, SwarmHandle, SwarmService};
pub use status::NodeStatus;
pub use transport::{MembershipEvent, Outbox, Transport};
pub use udp::UdpLink;

pub use swarm_peers::{Peer, Role};
pub use swarm_proto::{node_label, Millis, NodeId};
pub use swarm_state::{Deferred, StateChange, StateEntry, WILDCARD};
