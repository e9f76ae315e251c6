//! In-process mesh for tests and the simulator binary.
//!
//! [`SimNetwork`] is a shared broadcast bus with seeded loss, duplication and
//! reordering. [`SimCluster`] puts several engines on one bus with one shared
//! [`ManualClock`] and steps them deterministically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use swarm_proto::{Millis, NodeId};
use tracing::{trace, warn};

use crate::clock::ManualClock;
use crate::config::SwarmConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::transport::{MembershipEvent, Transport};

/// A frame waiting on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Bus {
    rng: StdRng,
    loss: f64,
    duplication: f64,
    attached: BTreeSet<NodeId>,
    queued: Vec<Delivery>,
    dropped: u64,
}

/// Shared lossy broadcast bus. Clones refer to the same bus.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    bus: Arc<Mutex<Bus>>,
}

impl SimNetwork {
    /// Perfect bus; delivery order is still shuffled by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            bus: Arc::new(Mutex::new(Bus {
                rng: StdRng::seed_from_u64(seed),
                loss: 0.0,
                duplication: 0.0,
                attached: BTreeSet::new(),
                queued: Vec::new(),
                dropped: 0,
            })),
        }
    }

    /// Drop each delivery with probability `loss`.
    #[must_use]
    pub fn with_loss(self, loss: f64) -> Self {
        self.lock().loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Deliver each surviving frame twice with probability `duplication`.
    #[must_use]
    pub fn with_duplication(self, duplication: f64) -> Self {
        self.lock().duplication = duplication.clamp(0.0, 1.0);
        self
    }

    /// Change the loss rate of a running bus.
    pub fn set_loss(&self, loss: f64) {
        self.lock().loss = loss.clamp(0.0, 1.0);
    }

    fn lock(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a node and hand back its transport.
    pub fn attach(&self, id: NodeId) -> SimTransport {
        self.lock().attached.insert(id);
        SimTransport {
            id,
            network: self.clone(),
        }
    }

    /// Detach a node. Frames already queued for it are discarded, and anything
    /// it sends from now on goes nowhere.
    pub fn detach(&self, id: NodeId) {
        let mut bus = self.lock();
        bus.attached.remove(&id);
        bus.queued.retain(|d| d.to != id);
    }

    fn broadcast(&self, from: NodeId, bytes: Vec<u8>) {
        let mut bus = self.lock();
        if !bus.attached.contains(&from) {
            return;
        }
        let targets: Vec<NodeId> = bus.attached.iter().copied().filter(|&to| to != from).collect();

        for to in targets {
            let (loss, duplication) = (bus.loss, bus.duplication);
            if bus.rng.gen_bool(loss) {
                bus.dropped += 1;
                trace!(from, to, "Sim bus dropped frame");
                continue;
            }
            let copies = if bus.rng.gen_bool(duplication) { 2 } else { 1 };
            for _ in 0..copies {
                bus.queued.push(Delivery {
                    from,
                    to,
                    bytes: bytes.clone(),
                });
            }
        }
    }

    /// Take every queued frame, in random order.
    pub fn drain(&self) -> Vec<Delivery> {
        let mut bus = self.lock();
        let mut out = std::mem::take(&mut bus.queued);
        out.shuffle(&mut bus.rng);
        out
    }

    pub fn in_flight(&self) -> usize {
        self.lock().queued.len()
    }

    /// Frames lost to the loss rate so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

/// One node's view of a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    id: NodeId,
    network: SimNetwork,
}

impl Transport for SimTransport {
    fn self_id(&self) -> NodeId {
        self.id
    }

    fn send_broadcast(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.network.broadcast(self.id, bytes);
        Ok(())
    }
}

pub type SimEngine = Engine<SimTransport, ManualClock>;

/// Bound on delivery rounds per step; responses to responses die out well
/// before this.
const MAX_SETTLE_ROUNDS: usize = 32;

/// Several engines sharing one bus and one clock.
#[derive(Debug)]
pub struct SimCluster {
    network: SimNetwork,
    clock: ManualClock,
    config: SwarmConfig,
    nodes: BTreeMap<NodeId, SimEngine>,
}

impl SimCluster {
    pub fn new(config: SwarmConfig, network: SimNetwork) -> Self {
        Self {
            network,
            clock: ManualClock::new(0),
            config,
            nodes: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Start a node and signal a connection between it and every running node.
    ///
    /// Returns `None`, leaving the cluster untouched, if `id` is already running.
    pub fn add_node(&mut self, id: NodeId) -> Option<&mut SimEngine> {
        if self.nodes.contains_key(&id) {
            warn!(id, "Node already in cluster");
            return None;
        }

        let transport = self.network.attach(id);
        let mut engine = Engine::new(&self.config, transport, self.clock.clone());

        for (&other_id, other) in &mut self.nodes {
            other.on_membership(MembershipEvent::Joined(id));
            engine.on_membership(MembershipEvent::Joined(other_id));
        }

        Some(self.nodes.entry(id).or_insert(engine))
    }

    /// Stop a node and signal the drop to everyone else.
    pub fn remove_node(&mut self, id: NodeId) -> Option<SimEngine> {
        let engine = self.nodes.remove(&id)?;
        self.network.detach(id);
        for other in self.nodes.values_mut() {
            other.on_membership(MembershipEvent::Dropped(id));
        }
        Some(engine)
    }

    pub fn node(&self, id: NodeId) -> Option<&SimEngine> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SimEngine> {
        self.nodes.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SimEngine> {
        self.nodes.values()
    }

    /// Deliver queued frames until the bus is quiet. Returns frames delivered.
    pub fn settle(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let batch = self.network.drain();
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                if let Some(engine) = self.nodes.get_mut(&delivery.to) {
                    engine.receive(delivery.from, &delivery.bytes);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Advance the clock by `dt`, tick every node, then settle the bus.
    pub fn step(&mut self, dt: Millis) -> usize {
        self.clock.advance(dt);
        for engine in self.nodes.values_mut() {
            engine.tick();
        }
        self.settle()
    }

    /// Step in increments of `dt` until `duration` has elapsed.
    pub fn run_for(&mut self, duration: Millis, dt: Millis) {
        let dt = dt.max(1);
        let mut elapsed = 0;
        while elapsed < duration {
            self.step(dt);
            elapsed += dt;
        }
    }

    /// Whether every node holds identical `(key, value, version, origin)` rows.
    pub fn converged(&self) -> bool {
        let mut views = self.nodes.values().map(|engine| {
            engine
                .snapshot_all()
                .into_iter()
                .map(|e| (e.key, e.value, e.version, e.origin))
                .collect::<Vec<_>>()
        });
        match views.next() {
            Some(first) => views.all(|view| view == first),
            None => true,
        }
    }

    /// Distinct coordinators the nodes currently believe in.
    pub fn coordinators(&self) -> BTreeSet<NodeId> {
        self.nodes.values().map(Engine::coordinator).collect()
    }
}
