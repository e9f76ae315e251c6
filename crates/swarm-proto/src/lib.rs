//! Swarm Protocol - Envelope codec for the state-sync mesh
//!
//! Every message on the mesh is a typed envelope `{type, sender, payload}`
//! carried as a JSON object:
//!
//! ```text
//! {"t": 2, "n": "N1A2B", "d": {"k": "led", "v": "on", "ver": 3, "org": 6699}}
//!   │        │              └── payload (shape depends on type)
//!   │        └── sender display name
//!   └── type code (1..=7)
//! ```
//!
//! The type codes and payload keys are fixed for interop with other mesh
//! implementations. Decoding is tolerant of missing payload fields (they take
//! their documented defaults) but rejects anything that is not a JSON object
//! with a numeric type code.
//!
//! Codes 5–7 belong to external collaborators (command console, telemetry
//! relay). They decode to [`Payload::Collaborator`] and are carried opaque.

mod envelope;
mod error;
mod payload;

pub use envelope::{Envelope, MsgType, Payload};
pub use error::DecodeError;
pub use payload::{Heartbeat, StateSync, StateUpdate, RESERVED_HEARTBEAT_KEYS};

/// Node identifier assigned by the mesh transport.
///
/// Stable for the lifetime of a process; the only ordering key used for
/// coordinator election and merge tie-breaks.
pub type NodeId = u32;

/// Milliseconds on a node's local monotonic clock. Never compared across nodes.
pub type Millis = u64;

/// Sender name used when an envelope omits one.
pub const UNKNOWN_SENDER: &str = "???";

/// Short display label for a node: `N` followed by the last four upper-case
/// hex digits of its id.
pub fn node_label(id: NodeId) -> String {
    let hex = format!("{id:X}");
    let tail = &hex[hex.len().saturating_sub(4)..];
    format!("N{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_uses_last_four_hex_digits() {
        assert_eq!(node_label(0xDEAD_BEEF), "NBEEF");
        assert_eq!(node_label(0x12_3456), "N3456");
    }

    #[test]
    fn label_short_ids_not_padded() {
        assert_eq!(node_label(0xA), "NA");
        assert_eq!(node_label(0), "N0");
    }
}
