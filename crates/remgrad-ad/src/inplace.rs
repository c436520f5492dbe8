//! Version table for in-place reasoning.
//!
//! Every mutation of a node's forward value after initial evaluation (an
//! optimizer step, a checkpoint recomputation) bumps the node's version so
//! downstream consumers that cached a tensor can detect staleness.
//! Recomputation notifies through [`on_recomputed`].

use crate::graph::{Node, NodeId};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

fn table() -> &'static Mutex<HashMap<NodeId, u64>> {
    static VERSIONS: OnceLock<Mutex<HashMap<NodeId, u64>>> = OnceLock::new();
    VERSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Increment a node's version, returning the new value.
pub fn bump_version(n: &Node) -> u64 {
    let mut t = table().lock().unwrap();
    let v = t.entry(n.id()).or_insert(0);
    *v += 1;
    *v
}

/// Current version of a node; 0 when it was never mutated.
pub fn version_of(n: &Node) -> u64 {
    table().lock().unwrap().get(&n.id()).copied().unwrap_or(0)
}

/// Notification that a node's value was regenerated by recomputation.
pub fn on_recomputed(n: &Node) {
    bump_version(n);
}

/// Drop all recorded versions.
pub fn reset() {
    table().lock().unwrap().clear();
}
