//! Payload shapes for the core message types.
//!
//! Field names are the short wire keys; every field has a default so that a
//! sparse payload from an older node still decodes. Heartbeats and syncs are
//! read leniently: a mistyped heartbeat field falls back to its default, and a
//! mistyped sync row is skipped without losing the rest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::NodeId;

/// Heartbeat keys owned by the protocol. Custom extras may not reuse them.
pub const RESERVED_HEARTBEAT_KEYS: [&str; 4] = ["role", "up", "heap", "states"];

fn default_role() -> String {
    "PEER".to_string()
}

/// Periodic liveness and status broadcast (type 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct Heartbeat {
    /// Sender's current role (`"COORD"` or `"PEER"`).
    #[serde(default = "default_role")]
    pub role: String,

    /// Seconds since the sender booted.
    #[serde(rename = "up", default)]
    pub uptime_secs: u64,

    /// Free heap reported by the sender's host, in bytes.
    #[serde(rename = "heap", default)]
    pub heap_free: u64,

    /// Number of state entries the sender holds.
    #[serde(rename = "states", default)]
    pub state_count: u64,

    /// Application-defined integer counters, flattened into the payload.
    /// Non-integer extras from other nodes are dropped on decode.
    #[serde(flatten)]
    pub extras: BTreeMap<String, i64>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            role: default_role(),
            uptime_secs: 0,
            heap_free: 0,
            state_count: 0,
            extras: BTreeMap::new(),
        }
    }
}

impl From<Map<String, Value>> for Heartbeat {
    fn from(mut fields: Map<String, Value>) -> Self {
        let mut counter = |key: &str| fields.remove(key).and_then(|v| v.as_u64()).unwrap_or(0);
        let uptime_secs = counter("up");
        let heap_free = counter("heap");
        let state_count = counter("states");

        let role = match fields.remove("role") {
            Some(Value::String(role)) => role,
            _ => default_role(),
        };
        let extras = fields
            .into_iter()
            .filter_map(|(key, value)| value.as_i64().map(|n| (key, n)))
            .collect();

        Self {
            role,
            uptime_secs,
            heap_free,
            state_count,
            extras,
        }
    }
}

/// A single versioned key write (type 2, and each row of a type 3 sync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(rename = "k", default)]
    pub key: String,

    #[serde(rename = "v", default)]
    pub value: String,

    #[serde(rename = "ver", default)]
    pub version: u32,

    /// Node that produced this version. Absent on the wire means "the
    /// transport-level sender".
    #[serde(rename = "org", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeId>,
}

impl StateUpdate {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        version: u32,
        origin: NodeId,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            origin: Some(origin),
        }
    }

    /// Origin to merge with, falling back to the node the datagram came from.
    pub fn origin_or(&self, sender: NodeId) -> NodeId {
        self.origin.unwrap_or(sender)
    }
}

/// Full snapshot of a node's state (type 3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct StateSync {
    #[serde(rename = "s", default)]
    pub entries: Vec<StateUpdate>,

    /// Rows dropped on decode because they did not parse.
    #[serde(skip)]
    pub skipped: usize,
}

impl StateSync {
    pub fn new(entries: Vec<StateUpdate>) -> Self {
        Self {
            entries,
            skipped: 0,
        }
    }
}

impl From<Map<String, Value>> for StateSync {
    fn from(mut fields: Map<String, Value>) -> Self {
        let rows = match fields.remove("s") {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        };
        let total = rows.len();
        let entries: Vec<StateUpdate> = rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect();

        Self {
            skipped: total - entries.len(),
            entries,
        }
    }
}

/// Body of a sync request (type 4). Carries a constant marker only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct SyncRequestBody {
    #[serde(default)]
    pub req: u8,
}

impl Default for SyncRequestBody {
    fn default() -> Self {
        Self { req: 1 }
    }
}
