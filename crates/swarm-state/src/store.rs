//! The versioned state store.

use std::collections::BTreeMap;

use swarm_proto::{Millis, NodeId};
use tracing::{debug, trace, warn};

use crate::entry::{MergeOutcome, StateEntry};
use crate::watch::{Deferred, StateChange, Watcher, WatcherBus};

/// Local replica of the shared key-value state.
///
/// Owns its entries and the watcher bus. Every mutating call takes the current
/// local clock reading so the store itself never reads time.
#[derive(Debug)]
pub struct StateStore {
    self_id: NodeId,
    entries: BTreeMap<String, StateEntry>,
    watchers: WatcherBus,
    deferred: Deferred,
}

impl StateStore {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            entries: BTreeMap::new(),
            watchers: WatcherBus::new(),
            deferred: Deferred::default(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Write a value on behalf of this node.
    ///
    /// Returns false (and does nothing) if the key already holds `value`.
    /// Otherwise bumps the version, stamps our own origin and notifies watchers.
    pub fn set_local(&mut self, key: &str, value: &str, now: Millis) -> bool {
        if key.is_empty() {
            warn!("Ignoring local write with empty key");
            return false;
        }

        let (version, old_value) = match self.entries.get(key) {
            Some(existing) if existing.value == value => return false,
            Some(existing) => (existing.version.saturating_add(1), existing.value.clone()),
            None => (1, String::new()),
        };

        self.store(StateEntry::new(key, value, version, self.self_id, now), &old_value);
        true
    }

    /// Apply several local writes in input order.
    ///
    /// Returns the keys that actually changed; unchanged pairs are skipped.
    pub fn set_local_batch<I, K, V>(&mut self, pairs: I, now: Millis) -> Vec<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        pairs
            .into_iter()
            .filter(|(key, value)| self.set_local(key.as_ref(), value.as_ref(), now))
            .map(|(key, _)| key.as_ref().to_string())
            .collect()
    }

    /// Merge a write received from the mesh. Returns true iff the value changed.
    pub fn apply_remote(
        &mut self,
        key: &str,
        value: &str,
        version: u32,
        origin: NodeId,
        now: Millis,
    ) -> bool {
        self.merge(key, value, version, origin, now).is_accepted()
    }

    /// Merge a write received from the mesh and report exactly what happened.
    pub fn merge(
        &mut self,
        key: &str,
        value: &str,
        version: u32,
        origin: NodeId,
        now: Millis,
    ) -> MergeOutcome {
        if key.is_empty() {
            trace!(origin, "Rejected remote write with empty key");
            return MergeOutcome::InvalidKey;
        }

        let old_value = match self.entries.get_mut(key) {
            None => String::new(),
            Some(existing) if !existing.is_superseded_by(version, origin) => {
                trace!(
                    key,
                    version,
                    origin,
                    local_version = existing.version,
                    local_origin = existing.origin,
                    "Remote write lost merge"
                );
                return MergeOutcome::Stale;
            }
            Some(existing) if existing.value == value => {
                existing.version = version;
                existing.origin = origin;
                existing.updated_at = now;
                trace!(key, version, origin, "Adopted metadata for identical value");
                return MergeOutcome::Adopted;
            }
            Some(existing) => existing.value.clone(),
        };

        debug!(key, value, version, origin, "Accepted remote write");
        self.store(StateEntry::new(key, value, version, origin, now), &old_value);
        MergeOutcome::Accepted
    }

    fn store(&mut self, entry: StateEntry, old_value: &str) {
        let key = entry.key.clone();
        self.entries.insert(key.clone(), entry);

        if let Some(stored) = self.entries.get(&key) {
            let change = StateChange {
                key: &stored.key,
                value: &stored.value,
                old_value,
                version: stored.version,
                origin: stored.origin,
            };
            self.watchers.notify(&change, &mut self.deferred);
        }
    }

    /// Current value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// Current value for `key`, or `default` if the key was never written.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn entry(&self, key: &str) -> Option<&StateEntry> {
        self.entries.get(key)
    }

    /// Owned copy of every entry, ordered by key.
    pub fn snapshot(&self) -> Vec<StateEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a watcher for `key` or [`WILDCARD`](crate::WILDCARD).
    pub fn subscribe<F>(&mut self, key: impl Into<String>, watcher: F)
    where
        F: FnMut(&StateChange<'_>, &mut Deferred) + Send + 'static,
    {
        let watcher: Watcher = Box::new(watcher);
        self.watchers.subscribe(key, watcher);
    }

    /// Drain writes that watchers staged during notification.
    pub fn take_deferred(&mut self) -> Vec<(String, String)> {
        self.deferred.take()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WILDCARD;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(String, String, String)>>>;

    fn watched_store(self_id: NodeId) -> (StateStore, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut store = StateStore::new(self_id);
        let sink = Arc::clone(&log);
        store.subscribe(WILDCARD, move |c: &StateChange<'_>, _: &mut Deferred| {
            sink.lock()
                .unwrap()
                .push((c.key.to_string(), c.value.to_string(), c.old_value.to_string()));
        });
        (store, log)
    }

    #[test]
    fn first_local_write_is_version_one() {
        let mut store = StateStore::new(42);
        assert!(store.set_local("led", "on", 100));

        let entry = store.entry("led").unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.origin, 42);
        assert_eq!(entry.updated_at, 100);
    }

    #[test]
    fn unchanged_local_write_is_noop() {
        let (mut store, log) = watched_store(42);
        assert!(store.set_local("led", "on", 0));
        assert!(!store.set_local("led", "on", 10));

        assert_eq!(store.entry("led").unwrap().version, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn changed_local_write_bumps_version() {
        let (mut store, log) = watched_store(42);
        store.set_local("led", "on", 0);
        store.set_local("led", "off", 0);

        assert_eq!(store.entry("led").unwrap().version, 2);
        assert_eq!(
            log.lock().unwrap().last().unwrap(),
            &("led".to_string(), "off".to_string(), "on".to_string())
        );
    }

    #[test]
    fn local_write_over_remote_entry_takes_origin() {
        let mut store = StateStore::new(42);
        store.apply_remote("led", "on", 7, 3, 0);
        store.set_local("led", "off", 0);

        let entry = store.entry("led").unwrap();
        assert_eq!(entry.version, 8);
        assert_eq!(entry.origin, 42);
    }

    #[test]
    fn empty_local_key_rejected() {
        let mut store = StateStore::new(1);
        assert!(!store.set_local("", "x", 0));
        assert!(store.is_empty());
    }

    #[test]
    fn batch_on_empty_store() {
        let (mut store, log) = watched_store(1);
        let changed = store.set_local_batch([("a", "1"), ("b", "2")], 0);

        assert_eq!(changed, vec!["a", "b"]);
        assert_eq!(store.entry("a").unwrap().version, 1);
        assert_eq!(store.entry("b").unwrap().version, 1);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn batch_skips_unchanged_pairs() {
        let mut store = StateStore::new(1);
        store.set_local("a", "1", 0);

        let pairs = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        let changed = store.set_local_batch(pairs, 0);
        assert_eq!(changed, vec!["b"]);
        assert!(store.set_local_batch([("a", "1")], 0).is_empty());
    }

    #[test]
    fn tie_break_prefers_lower_origin() {
        let mut store = StateStore::new(100);
        assert!(store.apply_remote("k", "0", 1, 5, 0));
        assert!(!store.apply_remote("k", "1", 1, 9, 0));

        let entry = store.entry("k").unwrap();
        assert_eq!(entry.value, "0");
        assert_eq!(entry.origin, 5);
    }

    #[test]
    fn tie_break_is_order_independent() {
        let mut store = StateStore::new(100);
        store.apply_remote("k", "1", 1, 9, 0);
        assert!(store.apply_remote("k", "0", 1, 5, 0));

        let entry = store.entry("k").unwrap();
        assert_eq!(entry.value, "0");
        assert_eq!(entry.origin, 5);
    }

    #[test]
    fn duplicate_remote_is_idempotent() {
        let (mut store, log) = watched_store(100);
        assert!(store.apply_remote("k", "v", 3, 7, 0));
        assert!(!store.apply_remote("k", "v", 3, 7, 0));

        assert_eq!(store.merge("k", "v", 3, 7, 0), MergeOutcome::Stale);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn older_remote_never_lowers_version() {
        let mut store = StateStore::new(100);
        store.apply_remote("k", "new", 5, 7, 0);
        assert_eq!(store.merge("k", "old", 4, 1, 0), MergeOutcome::Stale);

        let entry = store.entry("k").unwrap();
        assert_eq!(entry.version, 5);
        assert_eq!(entry.value, "new");
    }

    #[test]
    fn winning_identical_value_adopts_metadata_silently() {
        let (mut store, log) = watched_store(100);
        store.apply_remote("k", "v", 1, 7, 0);

        assert_eq!(store.merge("k", "v", 4, 9, 50), MergeOutcome::Adopted);
        let entry = store.entry("k").unwrap();
        assert_eq!((entry.version, entry.origin, entry.updated_at), (4, 9, 50));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_remote_key_is_invalid() {
        let mut store = StateStore::new(100);
        assert_eq!(store.merge("", "v", 1, 1, 0), MergeOutcome::InvalidKey);
        assert!(store.is_empty());
    }

    #[test]
    fn equal_version_and_origin_keeps_first_seen_value() {
        // Two different values under one (version, origin) break the single-writer
        // assumption; the first one seen stays.
        let mut store = StateStore::new(100);
        store.apply_remote("k", "first", 2, 7, 0);
        assert_eq!(store.merge("k", "second", 2, 7, 0), MergeOutcome::Stale);
        assert_eq!(store.get("k"), Some("first"));
    }

    #[test]
    fn empty_value_is_an_ordinary_value() {
        let mut store = StateStore::new(1);
        store.set_local("k", "x", 0);
        assert!(store.set_local("k", "", 0));
        assert_eq!(store.get("k"), Some(""));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_or_default() {
        let mut store = StateStore::new(1);
        assert_eq!(store.get_or("missing", "dflt"), "dflt");
        store.set_local("k", "v", 0);
        assert_eq!(store.get_or("k", "dflt"), "v");
    }

    #[test]
    fn snapshot_is_sorted_copy() {
        let mut store = StateStore::new(1);
        store.set_local("b", "2", 0);
        store.set_local("a", "1", 0);

        let snap = store.snapshot();
        store.set_local("a", "changed", 0);

        let keys: Vec<_> = snap.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(snap[0].value, "1");
    }

    #[test]
    fn watcher_writes_are_deferred() {
        let mut store = StateStore::new(1);
        store.subscribe("a", |c: &StateChange<'_>, d: &mut Deferred| {
            d.set("b", format!("saw {}", c.value));
        });

        store.set_local("a", "1", 0);
        assert_eq!(store.get("b"), None);
        assert!(store.has_deferred());

        let staged = store.take_deferred();
        assert_eq!(staged, vec![("b".to_string(), "saw 1".to_string())]);
        assert!(!store.has_deferred());
    }

    /// A remote write, keyed so that one `(key, version, origin)` never carries
    /// two different values.
    fn update_set() -> impl Strategy<Value = Vec<(String, String, u32, NodeId)>> {
        proptest::collection::hash_map(
            (prop::sample::select(vec!["a", "b", "c"]), 0u32..4, 0u32..4),
            prop::sample::select(vec!["x", "y", "z", ""]),
            1..24,
        )
        .prop_map(|m: HashMap<(&str, u32, u32), &str>| {
            m.into_iter()
                .map(|((k, ver, org), v)| (k.to_string(), v.to_string(), ver, org))
                .collect()
        })
    }

    fn replay(updates: &[(String, String, u32, NodeId)]) -> Vec<(String, String, u32, NodeId)> {
        let mut store = StateStore::new(1_000);
        for (k, v, ver, org) in updates {
            store.apply_remote(k, v, *ver, *org, 0);
        }
        store
            .snapshot()
            .into_iter()
            .map(|e| (e.key, e.value, e.version, e.origin))
            .collect()
    }

    proptest! {
        #[test]
        fn merge_converges_under_reordering_and_duplicates(
            updates in update_set(),
            seed in any::<u64>(),
            dup_mask in any::<u32>(),
        ) {
            let forward = replay(&updates);

            let mut shuffled: Vec<_> = updates.iter().rev().cloned().collect();
            // Rotate by a seed-derived amount and replay a subset twice.
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            for (i, u) in updates.iter().enumerate() {
                if dup_mask & (1 << (i % 32)) != 0 {
                    shuffled.push(u.clone());
                }
            }

            prop_assert_eq!(forward, replay(&shuffled));
        }

        #[test]
        fn versions_never_decrease(updates in update_set()) {
            let mut store = StateStore::new(1_000);
            let mut seen: HashMap<String, u32> = HashMap::new();
            for (k, v, ver, org) in &updates {
                store.apply_remote(k, v, *ver, *org, 0);
                let now = store.entry(k).map(|e| e.version).unwrap_or(0);
                let before = seen.insert(k.clone(), now).unwrap_or(0);
                prop_assert!(now >= before);
            }
        }
    }
}
