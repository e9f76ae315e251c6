//! The per-node engine.
//!
//! One [`Engine`] owns everything a node knows: its peer registry, its state
//! replica, its watchers and hooks, and the timers that drive heartbeats and
//! full-state syncs. It never blocks and never spawns; the host calls
//! [`tick`](Engine::tick) periodically and pushes inbound datagrams and
//! membership signals in as they arrive.
//!
//! # Flow
//!
//! ```text
//!   tick() ──► deferred writes ──► heartbeat + prune ──► full sync ──► tick hooks
//!
//!   receive(from, bytes)
//!     ├─ heartbeat ──► registry.record_heartbeat ──► election
//!     ├─ state set ──► store.merge
//!     ├─ state sync ─► store.merge (per row)
//!     └─ sync req ───► broadcast full state
//!
//!   set_local(k, v) ──► store ──► watchers ──► state-set broadcast ──► change hooks
//! ```

use std::collections::BTreeMap;

use serde_json::Value;
use swarm_peers::{Election, Peer, PeerRegistry, Role};
use swarm_proto::{
    node_label, Envelope, Heartbeat, Millis, MsgType, NodeId, Payload, StateSync, StateUpdate,
    RESERVED_HEARTBEAT_KEYS,
};
use swarm_state::{Deferred, MergeOutcome, StateChange, StateEntry, StateStore};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::{millis, SwarmConfig};
use crate::error::Error;
use crate::hooks::Hooks;
use crate::schedule::Interval;
use crate::status::NodeStatus;
use crate::transport::{MembershipEvent, Transport};

/// What [`Engine::receive`] did with a datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Peer heartbeat recorded.
    Heartbeat,
    /// Single-key write merged.
    StateSet(MergeOutcome),
    /// Full-state sync merged; `accepted` rows changed a value.
    StateSync { entries: usize, accepted: usize },
    /// Sync request answered with a full-state broadcast.
    SyncRequest,
    /// Collaborator message (types 5–7), untouched by the core.
    Collaborator(MsgType, Value),
    /// Well-formed but of no interest: unknown type, or our own heartbeat.
    Ignored,
    /// Not a decodable envelope. Dropped.
    Malformed,
}

/// A single mesh node.
pub struct Engine<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    name: String,
    peers: PeerRegistry,
    store: StateStore,
    hooks: Hooks,
    heartbeat: Interval,
    sync: Interval,
    peer_timeout: Millis,
    heap_free: u64,
    extras: BTreeMap<String, i64>,
}

impl<T: Transport, C: Clock> Engine<T, C> {
    /// Build an engine on top of `transport`.
    ///
    /// The node id always comes from the transport; `config.node_id` is only a
    /// hint for hosts that build the transport themselves.
    pub fn new(config: &SwarmConfig, transport: T, clock: C) -> Self {
        let id = transport.self_id();
        let name = config
            .node_name
            .clone()
            .unwrap_or_else(|| node_label(id));

        let engine = Self {
            transport,
            clock,
            name,
            peers: PeerRegistry::new(id),
            store: StateStore::new(id),
            hooks: Hooks::new(millis(config.telemetry_debounce)),
            heartbeat: Interval::new(millis(config.heartbeat_interval)),
            sync: Interval::new(millis(config.sync_interval)),
            peer_timeout: millis(config.peer_timeout),
            heap_free: 0,
            extras: BTreeMap::new(),
        };

        info!(
            id,
            name = %engine.name,
            heartbeat_ms = engine.heartbeat.period(),
            sync_ms = engine.sync.period(),
            "Swarm node started"
        );
        engine
    }

    // ---- driving ----------------------------------------------------------

    /// Run one scheduler pass.
    pub fn tick(&mut self) {
        let now = self.clock.now();

        let staged = self.store.take_deferred();
        if !staged.is_empty() {
            debug!(count = staged.len(), "Applying deferred watcher writes");
            self.set_local_batch(staged);
        }

        if self.heartbeat.poll(now) {
            self.send_heartbeat();

            let prune = self.peers.prune_stale(now, self.peer_timeout);
            for id in &prune.removed {
                info!(peer = id, "Peer timed out");
            }
            if let Some(election) = prune.election {
                self.log_election(election);
            }
        }

        if self.sync.poll(now) {
            self.broadcast_full_state();
        }

        let status = self.status();
        self.hooks.run_tick(&status);
    }

    /// Handle one datagram from `from`. Never fails: malformed input is logged
    /// and dropped.
    pub fn receive(&mut self, from: NodeId, bytes: &[u8]) -> Inbound {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from, error = %e, "Dropping undecodable envelope");
                return Inbound::Malformed;
            }
        };

        let now = self.clock.now();
        match envelope.payload {
            Payload::Heartbeat(hb) => {
                let known = self.peers.get(from).is_some_and(|p| p.alive);
                match self
                    .peers
                    .record_heartbeat(from, &envelope.sender_name, &hb.role, now)
                {
                    Some(election) => {
                        if !known {
                            info!(peer = from, name = %envelope.sender_name, "Peer joined");
                        }
                        self.log_election(election);
                        Inbound::Heartbeat
                    }
                    None => Inbound::Ignored,
                }
            }
            Payload::StateSet(update) => {
                let origin = update.origin_or(from);
                Inbound::StateSet(self.store.merge(
                    &update.key,
                    &update.value,
                    update.version,
                    origin,
                    now,
                ))
            }
            Payload::StateSync(sync) => {
                let accepted = sync
                    .entries
                    .iter()
                    .filter(|u| {
                        let origin = u.origin_or(from);
                        self.store
                            .apply_remote(&u.key, &u.value, u.version, origin, now)
                    })
                    .count();
                if sync.skipped > 0 {
                    warn!(from, skipped = sync.skipped, "Skipped malformed sync rows");
                }
                debug!(from, entries = sync.entries.len(), accepted, "Merged state sync");
                Inbound::StateSync {
                    entries: sync.entries.len(),
                    accepted,
                }
            }
            Payload::StateSyncRequest => {
                debug!(from, "Full state requested");
                self.broadcast_full_state();
                Inbound::SyncRequest
            }
            Payload::Collaborator(ty, data) => {
                trace!(from, msg_type = %ty, "Passing collaborator message to host");
                Inbound::Collaborator(ty, data)
            }
            Payload::Unknown(code) => {
                trace!(from, code, "Ignoring unknown message type");
                Inbound::Ignored
            }
        }
    }

    /// Handle a transport membership signal.
    pub fn on_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Joined(id) => {
                info!(peer = id, "Connection up, announcing");
                self.send_heartbeat();
                self.broadcast_full_state();
            }
            MembershipEvent::Dropped(id) => {
                info!(peer = id, "Connection dropped");
                let election = self.peers.mark_dropped(id);
                self.log_election(election);
            }
            MembershipEvent::TopologyChanged => {
                debug!("Topology changed");
                let election = self.peers.elect_coordinator();
                self.log_election(election);
            }
        }
    }

    // ---- state ------------------------------------------------------------

    /// Write a key on behalf of this node and broadcast it.
    ///
    /// Returns false if the key already held `value` (or the key is empty); in
    /// that case nothing is sent and no watcher or hook runs.
    pub fn set_local(&mut self, key: &str, value: &str) -> bool {
        let now = self.clock.now();
        if !self.store.set_local(key, value, now) {
            return false;
        }

        self.broadcast_key(key);
        self.signal_change(&[key.to_string()], now);
        true
    }

    /// Write several keys in order. Each changed key is broadcast on its own;
    /// change hooks get one signal for the whole batch.
    ///
    /// Returns the keys that changed.
    pub fn set_local_batch<I, K, V>(&mut self, pairs: I) -> Vec<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let now = self.clock.now();
        let changed = self.store.set_local_batch(pairs, now);
        if changed.is_empty() {
            return changed;
        }

        for key in &changed {
            self.broadcast_key(key);
        }
        self.signal_change(&changed, now);
        changed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.store.get(key)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.store.get_or(key, default)
    }

    /// Register a watcher for `key`, or every key with `"*"`.
    ///
    /// Watchers run inside the write that changed the value. Writes they stage
    /// on the [`Deferred`] queue are applied as local writes on the next tick.
    pub fn subscribe<F>(&mut self, key: impl Into<String>, watcher: F)
    where
        F: FnMut(&StateChange<'_>, &mut Deferred) + Send + 'static,
    {
        self.store.subscribe(key, watcher);
    }

    /// Owned copy of every state entry, sorted by key.
    pub fn snapshot_all(&self) -> Vec<StateEntry> {
        self.store.snapshot()
    }

    // ---- membership -------------------------------------------------------

    pub fn self_id(&self) -> NodeId {
        self.peers.self_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Alive peers, not counting this node.
    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    pub fn is_coordinator(&self) -> bool {
        self.peers.is_coordinator()
    }

    pub fn role(&self) -> Role {
        self.peers.role()
    }

    pub fn coordinator(&self) -> NodeId {
        self.peers.coordinator()
    }

    /// Owned copy of every known peer, ascending by id.
    pub fn snapshot_peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    // ---- broadcasts -------------------------------------------------------

    /// Ask every peer for its full state.
    pub fn request_full_sync(&mut self) {
        debug!("Requesting full state sync");
        self.broadcast(Payload::StateSyncRequest);
    }

    /// Broadcast every entry in one sync envelope. Returns false when the
    /// store is empty (nothing is sent) or the send failed.
    pub fn broadcast_full_state(&mut self) -> bool {
        if self.store.is_empty() {
            trace!("Skipping full sync of empty state");
            return false;
        }

        let entries: Vec<StateUpdate> = self.store.iter().map(StateEntry::to_update).collect();
        debug!(entries = entries.len(), "Broadcasting full state");
        self.broadcast(Payload::StateSync(StateSync::new(entries)))
    }

    // ---- heartbeat extras -------------------------------------------------

    /// Attach an integer counter to every outgoing heartbeat.
    ///
    /// Keys owned by the heartbeat itself are refused.
    pub fn set_heartbeat_data(&mut self, key: &str, value: i64) -> bool {
        if key.is_empty() || RESERVED_HEARTBEAT_KEYS.contains(&key) {
            warn!(key, "Refusing reserved heartbeat key");
            return false;
        }
        self.extras.insert(key.to_string(), value);
        true
    }

    /// Free memory figure reported in heartbeats. Supplied by the host.
    pub fn set_heap_free(&mut self, bytes: u64) {
        self.heap_free = bytes;
    }

    // ---- hooks ------------------------------------------------------------

    /// Run `hook` after every tick.
    pub fn on_tick<F>(&mut self, hook: F)
    where
        F: FnMut(&NodeStatus) + Send + 'static,
    {
        self.hooks.on_tick(Box::new(hook));
    }

    /// Run `hook` after local writes, at most once per debounce window.
    pub fn on_local_change<F>(&mut self, hook: F)
    where
        F: FnMut(&NodeStatus, &[String]) + Send + 'static,
    {
        self.hooks.on_local_change(Box::new(hook));
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.self_id(),
            name: self.name.clone(),
            role: self.peers.role(),
            coordinator: self.peers.coordinator(),
            uptime_secs: self.clock.now() / 1000,
            peer_count: self.peers.peer_count(),
            state_count: self.store.len(),
            heap_free: self.heap_free,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ---- internals --------------------------------------------------------

    fn send_heartbeat(&mut self) {
        let heartbeat = Heartbeat {
            role: self.peers.role().as_wire().to_string(),
            uptime_secs: self.clock.now() / 1000,
            heap_free: self.heap_free,
            state_count: self.store.len() as u64,
            extras: self.extras.clone(),
        };
        trace!(peers = self.peers.peer_count(), "Sending heartbeat");
        self.broadcast(Payload::Heartbeat(heartbeat));
    }

    fn broadcast_key(&mut self, key: &str) {
        if let Some(update) = self.store.entry(key).map(StateEntry::to_update) {
            self.broadcast(Payload::StateSet(update));
        }
    }

    fn broadcast(&mut self, payload: Payload) -> bool {
        let envelope = Envelope::new(self.name.clone(), payload);
        let sent = envelope
            .encode()
            .map_err(Error::from)
            .and_then(|bytes| self.transport.send_broadcast(bytes));

        match sent {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, msg_type = ?envelope.msg_type(), "Broadcast failed");
                false
            }
        }
    }

    fn signal_change(&mut self, keys: &[String], now: Millis) {
        if self.hooks.change_ready(now) {
            let status = self.status();
            self.hooks.run_change(&status, keys);
        }
    }

    fn log_election(&self, election: Election) {
        if election.role_changed() {
            info!(
                coordinator = election.coordinator,
                "Role: {} -> {}", election.previous, election.current
            );
        } else {
            trace!(coordinator = election.coordinator, "Election unchanged");
        }
    }
}

impl<T: Transport + std::fmt::Debug, C: Clock + std::fmt::Debug> std::fmt::Debug for Engine<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("clock", &self.clock)
            .field("peers", &self.peers)
            .field("store", &self.store)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
