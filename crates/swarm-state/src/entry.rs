//! State entries and the merge decision.

use serde::{Deserialize, Serialize};
use swarm_proto::{Millis, NodeId, StateUpdate};

/// One versioned key-value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: String,
    /// Starts at 1 on a key's first local write.
    pub version: u32,
    /// Node that produced this version.
    pub origin: NodeId,
    /// Local clock reading when this node stored the entry.
    pub updated_at: Millis,
}

impl StateEntry {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        version: u32,
        origin: NodeId,
        updated_at: Millis,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            origin,
            updated_at,
        }
    }

    /// Check if a write stamped `(version, origin)` outranks this entry.
    pub fn is_superseded_by(&self, version: u32, origin: NodeId) -> bool {
        version > self.version || (version == self.version && origin < self.origin)
    }

    /// Wire form for single-key and full-sync broadcasts.
    pub fn to_update(&self) -> StateUpdate {
        StateUpdate::new(self.key.clone(), self.value.clone(), self.version, self.origin)
    }
}

/// What a remote merge did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New key, or a winning update with a different value. Watchers fired.
    Accepted,
    /// Winning update with the value we already hold: version and origin were
    /// adopted so metadata converges, but nothing observable changed.
    Adopted,
    /// The update lost the `(version, origin)` comparison, or was an exact
    /// duplicate. Expected and silent.
    Stale,
    /// Empty key.
    InvalidKey,
}

impl MergeOutcome {
    /// True only when the value changed.
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_version_wins() {
        let entry = StateEntry::new("k", "a", 3, 9, 0);
        assert!(entry.is_superseded_by(4, 9));
        assert!(entry.is_superseded_by(4, 100));
        assert!(!entry.is_superseded_by(2, 1));
    }

    #[test]
    fn equal_version_lower_origin_wins() {
        let entry = StateEntry::new("k", "a", 3, 9, 0);
        assert!(entry.is_superseded_by(3, 5));
        assert!(!entry.is_superseded_by(3, 9));
        assert!(!entry.is_superseded_by(3, 10));
    }

    #[test]
    fn to_update_carries_origin() {
        let entry = StateEntry::new("k", "v", 2, 7, 123);
        let update = entry.to_update();
        assert_eq!(update, StateUpdate::new("k", "v", 2, 7));
    }
}
