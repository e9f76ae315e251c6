//! Watcher bus: per-key and wildcard change subscriptions.
//!
//! Watchers run synchronously, on the caller's thread, inside the write that
//! changed the value. They cannot reach back into the store: the store owns
//! them, so a reentrant write would need a second mutable borrow. Instead a
//! watcher stages writes on the [`Deferred`] queue it is handed; the engine
//! applies staged writes as ordinary local writes at the start of its next
//! tick.

use std::collections::HashMap;

use swarm_proto::NodeId;

/// Subscription key matching every state key.
pub const WILDCARD: &str = "*";

/// A value change delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange<'a> {
    pub key: &'a str,
    pub value: &'a str,
    /// Previous value, empty for a key seen for the first time.
    pub old_value: &'a str,
    pub version: u32,
    pub origin: NodeId,
}

/// Writes staged by watchers, applied on the next tick.
#[derive(Debug, Default)]
pub struct Deferred {
    writes: Vec<(String, String)>,
}

impl Deferred {
    /// Stage a local write.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.writes.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Drain staged writes in the order they were staged.
    pub fn take(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.writes)
    }
}

/// Boxed watcher callback.
pub type Watcher = Box<dyn FnMut(&StateChange<'_>, &mut Deferred) + Send>;

/// Ordered watcher registry.
#[derive(Default)]
pub struct WatcherBus {
    by_key: HashMap<String, Vec<Watcher>>,
}

impl WatcherBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher for `key`, or for every key with [`WILDCARD`].
    /// Watchers are never removed.
    pub fn subscribe(&mut self, key: impl Into<String>, watcher: Watcher) {
        self.by_key.entry(key.into()).or_default().push(watcher);
    }

    /// Run the key's watchers, then the wildcard watchers, each group in
    /// registration order.
    pub fn notify(&mut self, change: &StateChange<'_>, deferred: &mut Deferred) {
        if change.key != WILDCARD {
            if let Some(watchers) = self.by_key.get_mut(change.key) {
                for watcher in watchers.iter_mut() {
                    watcher(change, deferred);
                }
            }
        }
        if let Some(watchers) = self.by_key.get_mut(WILDCARD) {
            for watcher in watchers.iter_mut() {
                watcher(change, deferred);
            }
        }
    }

    /// Total number of registered watchers.
    pub fn len(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for WatcherBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherBus")
            .field("keys", &self.by_key.keys().collect::<Vec<_>>())
            .field("watchers", &self.len())
            .finish()
    }
}
