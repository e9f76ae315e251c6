//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use swarm_proto::{Millis, NodeId};

use crate::error::{Error, Result};

/// Default UDP port shared by every node of a mesh.
pub const DEFAULT_PORT: u16 = 5555;

/// Configuration for a swarm node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmConfig {
    /// Node id. When unset the host picks one (the UDP binary uses a random id).
    pub node_id: Option<NodeId>,

    /// Display name. Defaults to the node label derived from the id.
    pub node_name: Option<String>,

    /// Heartbeat broadcast period; also the stale-peer prune period.
    pub heartbeat_interval: Duration,

    /// Full-state broadcast period.
    pub sync_interval: Duration,

    /// Silence after which a peer is pruned.
    pub peer_timeout: Duration,

    /// Minimum gap between two local-change signals to collaborators.
    pub telemetry_debounce: Duration,

    /// How often the service driver calls `tick()`.
    pub tick_interval: Duration,

    /// Local UDP bind address.
    pub bind_addr: SocketAddr,

    /// Destination for outbound broadcasts.
    pub broadcast_addr: SocketAddr,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_name: None,
            heartbeat_interval: Duration::from_millis(5_000),
            sync_interval: Duration::from_millis(10_000),
            peer_timeout: Duration::from_millis(15_000),
            telemetry_debounce: Duration::from_millis(2_000),
            tick_interval: Duration::from_millis(100),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], DEFAULT_PORT)),
        }
    }
}

impl SwarmConfig {
    /// Defaults overlaid with `SWARM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("SWARM_NODE_ID") {
            config.node_id = Some(parse("SWARM_NODE_ID", &id)?);
        }
        if let Some(name) = lookup("SWARM_NODE_NAME").filter(|n| !n.trim().is_empty()) {
            config.node_name = Some(name.trim().to_string());
        }
        if let Some(ms) = lookup("SWARM_HEARTBEAT_MS") {
            config.heartbeat_interval = Duration::from_millis(parse("SWARM_HEARTBEAT_MS", &ms)?);
        }
        if let Some(ms) = lookup("SWARM_SYNC_MS") {
            config.sync_interval = Duration::from_millis(parse("SWARM_SYNC_MS", &ms)?);
        }
        if let Some(ms) = lookup("SWARM_PEER_TIMEOUT_MS") {
            config.peer_timeout = Duration::from_millis(parse("SWARM_PEER_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = lookup("SWARM_TELEMETRY_DEBOUNCE_MS") {
            config.telemetry_debounce =
                Duration::from_millis(parse("SWARM_TELEMETRY_DEBOUNCE_MS", &ms)?);
        }
        if let Some(addr) = lookup("SWARM_BIND_ADDR") {
            config.bind_addr = parse("SWARM_BIND_ADDR", &addr)?;
        }
        if let Some(addr) = lookup("SWARM_BROADCAST_ADDR") {
            config.broadcast_addr = parse("SWARM_BROADCAST_ADDR", &addr)?;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    #[must_use]
    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_telemetry_debounce(mut self, gap: Duration) -> Self {
        self.telemetry_debounce = gap;
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn with_broadcast_addr(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }
}

/// Convert a duration to engine milliseconds, saturating.
pub(crate) fn millis(duration: Duration) -> Millis {
    u64::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_reference_timings() {
        let config = SwarmConfig::default();
        assert_eq!(millis(config.heartbeat_interval), 5_000);
        assert_eq!(millis(config.sync_interval), 10_000);
        assert_eq!(millis(config.peer_timeout), 15_000);
        assert_eq!(millis(config.telemetry_debounce), 2_000);
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn env_overrides() {
        let config = SwarmConfig::from_lookup(lookup(&[
            ("SWARM_NODE_ID", "1234"),
            ("SWARM_NODE_NAME", " kitchen "),
            ("SWARM_HEARTBEAT_MS", "1000"),
            ("SWARM_BROADCAST_ADDR", "192.168.1.255:6000"),
        ]))
        .unwrap();

        assert_eq!(config.node_id, Some(1234));
        assert_eq!(config.node_name.as_deref(), Some("kitchen"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.broadcast_addr.port(), 6000);
        assert_eq!(config.sync_interval, SwarmConfig::default().sync_interval);
    }

    #[test]
    fn blank_name_ignored() {
        let config = SwarmConfig::from_lookup(lookup(&[("SWARM_NODE_NAME", "  ")])).unwrap();
        assert_eq!(config.node_name, None);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = SwarmConfig::from_lookup(lookup(&[("SWARM_SYNC_MS", "soon")])).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("SWARM_SYNC_MS")));

        let err = SwarmConfig::from_lookup(lookup(&[("SWARM_NODE_ID", "-1")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builder_setters() {
        let config = SwarmConfig::default()
            .with_node_id(7)
            .with_node_name("n7")
            .with_peer_timeout(Duration::from_secs(3));
        assert_eq!(config.node_id, Some(7));
        assert_eq!(config.node_name.as_deref(), Some("n7"));
        assert_eq!(config.peer_timeout, Duration::from_secs(3));
    }
}
