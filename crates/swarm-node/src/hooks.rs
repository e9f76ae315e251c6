//! Host callbacks run by the engine.
//!
//! Two ordered registries: tick hooks run after every `tick()`, change hooks
//! run after a local write (once per changed `set_local`, once per batch) and
//! are rate limited so a burst of writes produces one push.

use swarm_proto::Millis;
use tracing::trace;

use crate::schedule::Debounce;
use crate::status::NodeStatus;

/// Runs after every tick.
pub type TickHook = Box<dyn FnMut(&NodeStatus) + Send>;

/// Runs after a local change with the keys that changed.
pub type ChangeHook = Box<dyn FnMut(&NodeStatus, &[String]) + Send>;

pub struct Hooks {
    tick: Vec<TickHook>,
    change: Vec<ChangeHook>,
    gate: Debounce,
}

impl Hooks {
    pub fn new(change_debounce: Millis) -> Self {
        Self {
            tick: Vec::new(),
            change: Vec::new(),
            gate: Debounce::new(change_debounce),
        }
    }

    pub fn on_tick(&mut self, hook: TickHook) {
        self.tick.push(hook);
    }

    pub fn on_local_change(&mut self, hook: ChangeHook) {
        self.change.push(hook);
    }

    pub fn run_tick(&mut self, status: &NodeStatus) {
        for hook in &mut self.tick {
            hook(status);
        }
    }

    /// Whether a change signal raised at `now` may go out. Consumes the slot
    /// when it returns true. Always false when nobody listens.
    pub fn change_ready(&mut self, now: Millis) -> bool {
        if self.change.is_empty() {
            return false;
        }
        if self.gate.ready(now) {
            true
        } else {
            trace!(
                retry_in_ms = self.gate.remaining(now),
                "Change signal suppressed by debounce"
            );
            false
        }
    }

    pub fn run_change(&mut self, status: &NodeStatus, keys: &[String]) {
        for hook in &mut self.change {
            hook(status, keys);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("tick", &self.tick.len())
            .field("change", &self.change.len())
            .field("gate", &self.gate)
            .finish()
    }
}
