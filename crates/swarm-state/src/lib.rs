//! Swarm State - Versioned key-value store with deterministic merge
//!
//! Each node holds one [`StateEntry`] per key. Local writes bump the version;
//! remote writes carry their own `(version, origin)` and are merged with a
//! rule that needs no coordination:
//!
//! ```text
//! incoming wins  ⇔  incoming.version > local.version
//!               ∨ (incoming.version == local.version ∧ incoming.origin < local.origin)
//! ```
//!
//! The rule is a total order on `(version, origin)`, so merging is
//! commutative, idempotent and associative: nodes that eventually see the
//! same set of updates hold the same entry, whatever order the mesh
//! delivered them in.
//!
//! # Deletion
//!
//! There is none. Writing an empty string is an ordinary value.

mod entry;
mod store;
pub mod watch;

pub use entry::{MergeOutcome, StateEntry};
pub use store::StateStore;
pub use watch::{Deferred, StateChange, WatcherBus, WILDCARD};
