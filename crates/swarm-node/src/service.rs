//! Tokio driver for one engine.
//!
//! The engine is single-threaded and non-blocking, so the service keeps it
//! inside one task and serializes everything onto it:
//!
//! ```text
//!   SwarmHandle ──commands──┐
//!   Link.inbound ──frames───┼──► select! ──► Engine ──► Outbox ──► Link.outbound
//!   interval ─────ticks─────┘
//! ```
//!
//! Handles are cheap to clone. Once the service stops, every handle call
//! returns [`Error::ServiceClosed`].

use std::time::Duration;

use swarm_peers::Peer;
use swarm_proto::NodeId;
use swarm_state::watch::Watcher;
use swarm_state::StateEntry;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::SwarmConfig;
use crate::engine::{Engine, Inbound};
use crate::error::{Error, Result};
use crate::status::NodeStatus;
use crate::transport::{MembershipEvent, Outbox};

/// A datagram body tagged with its sender id.
pub type Datagram = (NodeId, Vec<u8>);

const COMMAND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Network-facing ends of a service: push received frames into `inbound`,
/// drain frames to send from `outbound`.
#[derive(Debug)]
pub struct Link {
    pub inbound: mpsc::Sender<Datagram>,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

enum Command {
    SetLocal {
        key: String,
        value: String,
        resp: oneshot::Sender<bool>,
    },
    SetLocalBatch {
        pairs: Vec<(String, String)>,
        resp: oneshot::Sender<Vec<String>>,
    },
    Get {
        key: String,
        resp: oneshot::Sender<Option<String>>,
    },
    Subscribe {
        key: String,
        watcher: Watcher,
    },
    RequestFullSync,
    BroadcastFullState {
        resp: oneshot::Sender<bool>,
    },
    SetHeartbeatData {
        key: String,
        value: i64,
        resp: oneshot::Sender<bool>,
    },
    SetHeapFree(u64),
    Membership(MembershipEvent),
    Status {
        resp: oneshot::Sender<NodeStatus>,
    },
    SnapshotAll {
        resp: oneshot::Sender<Vec<StateEntry>>,
    },
    SnapshotPeers {
        resp: oneshot::Sender<Vec<Peer>>,
    },
    Shutdown,
}

/// Owns an engine and drives it from a tokio task.
pub struct SwarmService<C: Clock = SystemClock> {
    engine: Engine<Outbox, C>,
    tick_every: Duration,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<Datagram>,
}

impl SwarmService<SystemClock> {
    pub fn new(config: &SwarmConfig, self_id: NodeId) -> (Self, SwarmHandle, Link) {
        Self::with_clock(config, self_id, SystemClock::new())
    }
}

impl<C: Clock> SwarmService<C> {
    pub fn with_clock(
        config: &SwarmConfig,
        self_id: NodeId,
        clock: C,
    ) -> (Self, SwarmHandle, Link) {
        let (outbox, outbound) = Outbox::new(self_id);
        let (cmd_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);

        let service = Self {
            engine: Engine::new(config, outbox, clock),
            tick_every: config.tick_interval,
            commands,
            inbound,
        };
        let handle = SwarmHandle { tx: cmd_tx };
        let link = Link {
            inbound: inbound_tx,
            outbound,
        };
        (service, handle, link)
    }

    /// Register a post-tick hook before the service starts.
    pub fn on_tick<F>(&mut self, hook: F)
    where
        F: FnMut(&NodeStatus) + Send + 'static,
    {
        self.engine.on_tick(hook);
    }

    /// Register a post-change hook before the service starts.
    pub fn on_local_change<F>(&mut self, hook: F)
    where
        F: FnMut(&NodeStatus, &[String]) + Send + 'static,
    {
        self.engine.on_local_change(hook);
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.engine.tick(),

                Some((from, bytes)) = self.inbound.recv() => {
                    if let Inbound::Collaborator(ty, _) = self.engine.receive(from, &bytes) {
                        debug!(from, msg_type = %ty, "No collaborator attached, dropping");
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd),
                },
            }
        }

        info!(id = self.engine.self_id(), "Swarm service stopped");
    }

    // Replies are best effort: a caller that gave up has dropped its receiver.
    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::SetLocal { key, value, resp } => {
                let _ = resp.send(self.engine.set_local(&key, &value));
            }
            Command::SetLocalBatch { pairs, resp } => {
                let _ = resp.send(self.engine.set_local_batch(pairs));
            }
            Command::Get { key, resp } => {
                let _ = resp.send(self.engine.get(&key).map(str::to_string));
            }
            Command::Subscribe { key, watcher } => self.engine.subscribe(key, watcher),
            Command::RequestFullSync => self.engine.request_full_sync(),
            Command::BroadcastFullState { resp } => {
                let _ = resp.send(self.engine.broadcast_full_state());
            }
            Command::SetHeartbeatData { key, value, resp } => {
                let _ = resp.send(self.engine.set_heartbeat_data(&key, value));
            }
            Command::SetHeapFree(bytes) => self.engine.set_heap_free(bytes),
            Command::Membership(event) => self.engine.on_membership(event),
            Command::Status { resp } => {
                let _ = resp.send(self.engine.status());
            }
            Command::SnapshotAll { resp } => {
                let _ = resp.send(self.engine.snapshot_all());
            }
            Command::SnapshotPeers { resp } => {
                let _ = resp.send(self.engine.snapshot_peers());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle to a running [`SwarmService`].
#[derive(Debug, Clone)]
pub struct SwarmHandle {
    tx: mpsc::Sender<Command>,
}

impl SwarmHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::ServiceClosed)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (resp, rx) = oneshot::channel();
        self.send(make(resp)).await?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    pub async fn set_local(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<bool> {
        let (key, value) = (key.into(), value.into());
        self.request(|resp| Command::SetLocal { key, value, resp }).await
    }

    pub async fn set_local_batch<I, K, V>(&self, pairs: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.request(|resp| Command::SetLocalBatch { pairs, resp }).await
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>> {
        let key = key.into();
        self.request(|resp| Command::Get { key, resp }).await
    }

    /// Register a watcher. See [`Engine::subscribe`].
    pub async fn subscribe<F>(&self, key: impl Into<String>, watcher: F) -> Result<()>
    where
        F: FnMut(&swarm_state::StateChange<'_>, &mut swarm_state::Deferred) + Send + 'static,
    {
        self.send(Command::Subscribe {
            key: key.into(),
            watcher: Box::new(watcher),
        })
        .await
    }

    pub async fn request_full_sync(&self) -> Result<()> {
        self.send(Command::RequestFullSync).await
    }

    pub async fn broadcast_full_state(&self) -> Result<bool> {
        self.request(|resp| Command::BroadcastFullState { resp }).await
    }

    pub async fn set_heartbeat_data(&self, key: impl Into<String>, value: i64) -> Result<bool> {
        let key = key.into();
        self.request(|resp| Command::SetHeartbeatData { key, value, resp }).await
    }

    pub async fn set_heap_free(&self, bytes: u64) -> Result<()> {
        self.send(Command::SetHeapFree(bytes)).await
    }

    /// Forward a transport membership signal.
    pub async fn membership(&self, event: MembershipEvent) -> Result<()> {
        self.send(Command::Membership(event)).await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(|resp| Command::Status { resp }).await
    }

    pub async fn peer_count(&self) -> Result<usize> {
        Ok(self.status().await?.peer_count)
    }

    pub async fn is_coordinator(&self) -> Result<bool> {
        Ok(self.status().await?.is_coordinator())
    }

    pub async fn snapshot_all(&self) -> Result<Vec<StateEntry>> {
        self.request(|resp| Command::SnapshotAll { resp }).await
    }

    pub async fn snapshot_peers(&self) -> Result<Vec<Peer>> {
        self.request(|resp| Command::SnapshotPeers { resp }).await
    }

    /// Stop the service loop. Pending commands queued after this are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}
