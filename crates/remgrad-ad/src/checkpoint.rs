//! Activation checkpointing: trade compute for memory.
//!
//! A checkpoint node is a recomputation boundary. Marking snapshots the
//! node's input tensors (owned copies, one slot per input) and optionally
//! the ambient RNG state; after that, activations behind the checkpoint may
//! be evicted and are regenerated on demand during backward.
//!
//! The lifecycle is:
//! 1. mark nodes ([`mark_node_checkpoint`] or the auto heuristics),
//! 2. run or fill the forward pass ([`compute_forward_values`]),
//! 3. refresh snapshots ([`capture_checkpoint_snapshots`]),
//! 4. free non-protected activations ([`evict_non_checkpoint_values`]),
//! 5. run `backward`, which calls [`recompute_subgraph`] for whatever is
//!    missing.

use crate::graph::{topo_from, NodeId, NodeRef, Tensor, Value};
use crate::inplace;
use crate::ops::forward_eval_node;
use crate::rng;
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Flags controlling checkpoint marking.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Capture the ambient RNG state so stochastic ops replay identically.
    pub save_rng: bool,
}

/// What an eviction sweep freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    /// Nodes whose value and tape were cleared.
    pub cleared_nodes: usize,
    /// Bytes of element storage released.
    pub cleared_bytes: usize,
}

/// Mark a node as a recomputation boundary. Idempotent.
///
/// Stores owned copies of the parents' currently-available values, leaving
/// an unoccupied slot where a parent has no value yet; those slots are
/// resolved by [`capture_checkpoint_snapshots`] after a forward pass, or by
/// recursive recomputation.
pub fn mark_node_checkpoint(node: &NodeRef, opts: &CheckpointOptions) {
    if node.is_checkpoint() {
        return;
    }
    node.set_checkpoint(true);

    let slots: Vec<Option<Tensor>> = node.inputs().iter().map(|p| p.value()).collect();
    node.set_saved_inputs(slots);

    node.set_saved_rng(if opts.save_rng {
        Some(rng::save_state())
    } else {
        None
    });
}

/// Whether a node has been checkpoint-marked.
pub fn is_checkpointed(node: &NodeRef) -> bool {
    node.is_checkpoint()
}

/// Fill every missing forward value reachable from `root`, in topological
/// order.
///
/// Per-node failures are reported on the diagnostic channel and traversal
/// continues, so independent branches still materialize.
pub fn compute_forward_values(root: &Value) {
    for n in topo_from(root.node()) {
        if n.has_value() || n.inputs().is_empty() {
            continue;
        }
        match forward_eval_node(&n) {
            Ok(v) => {
                n.set_value(v);
                inplace::on_recomputed(&n);
            }
            Err(e) => {
                eprintln!("[compute_forward_values] failed at {}: {}", n.label(), e);
            }
        }
    }
}

/// Overwrite every checkpoint's snapshots with fresh copies of its parents'
/// current values.
///
/// Lets marking happen before the forward pass runs and snapshotting after.
pub fn capture_checkpoint_snapshots(root: &Value) {
    for n in topo_from(root.node()) {
        if !n.is_checkpoint() {
            continue;
        }
        let slots: Vec<Option<Tensor>> = n.inputs().iter().map(|p| p.value()).collect();
        n.set_saved_inputs(slots);
    }
}

/// The live range that eviction must keep: every node on a path from the
/// root that does not pass through a checkpoint, checkpoints included.
///
/// Descent stops at checkpoint nodes; their ancestors are reachable via
/// recomputation and may be freed.
pub fn protected_set(root: &Value) -> HashSet<NodeId> {
    let mut protected = HashSet::new();
    let mut queue: VecDeque<NodeRef> = VecDeque::new();
    queue.push_back(Arc::clone(root.node()));

    while let Some(n) = queue.pop_front() {
        if !protected.insert(n.id()) {
            continue;
        }
        if n.is_checkpoint() {
            continue;
        }
        for p in n.inputs() {
            queue.push_back(Arc::clone(p));
        }
    }
    protected
}

/// Clear the value and tape of every reachable node outside the protected
/// live range.
pub fn evict_non_checkpoint_values(root: &Value) -> EvictionStats {
    let protected = protected_set(root);

    let mut stats = EvictionStats {
        cleared_nodes: 0,
        cleared_bytes: 0,
    };
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeRef> = VecDeque::new();
    queue.push_back(Arc::clone(root.node()));

    while let Some(n) = queue.pop_front() {
        if !seen.insert(n.id()) {
            continue;
        }
        if !protected.contains(&n.id()) {
            stats.cleared_bytes += n.value_numel() * std::mem::size_of::<f64>();
            n.clear_value();
            n.clear_tape();
            stats.cleared_nodes += 1;
        }
        for p in n.inputs() {
            queue.push_back(Arc::clone(p));
        }
    }

    if crate::debug::node_tracing_enabled() {
        eprintln!(
            "[evict] freed {} activations (~{:.3} MB)",
            stats.cleared_nodes,
            stats.cleared_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    stats
}

/// Restore a node's missing parent values from its snapshots, recursing
/// into checkpointed ancestors for unoccupied slots.
///
/// Parents that still have live values are left untouched. Parents that
/// cannot be restored are also left untouched; the caller decides whether
/// that is fatal.
pub fn restore_missing_inputs(node: &NodeRef) -> Result<()> {
    for (i, parent) in node.inputs().iter().enumerate() {
        if parent.has_value() {
            continue;
        }
        match node.saved_input(i) {
            Some(snapshot) => parent.set_value(snapshot),
            None => {
                if parent.is_checkpoint() {
                    recompute_subgraph(parent)?;
                }
            }
        }
    }
    Ok(())
}

/// Regenerate a checkpointed node's value.
///
/// Restores the RNG state first when one was captured, then assigns each
/// occupied snapshot slot to its parent, recursing into checkpointed
/// parents for unoccupied slots, and finally re-runs the node's forward
/// evaluator. Returns `Ok(false)` when the node is not an eligible
/// checkpoint or a parent cannot be restored; forward evaluation failures
/// surface as errors.
pub fn recompute_subgraph(node: &NodeRef) -> Result<bool> {
    if !node.is_checkpoint() || !node.has_saved_inputs() {
        eprintln!(
            "[checkpoint] no saved inputs to recompute {} (is_checkpoint={})",
            node.label(),
            node.is_checkpoint()
        );
        return Ok(false);
    }

    if let Some(blob) = node.saved_rng() {
        rng::restore_state(&blob)?;
    }

    for (i, parent) in node.inputs().iter().enumerate() {
        match node.saved_input(i) {
            Some(snapshot) => parent.set_value(snapshot),
            None => {
                if parent.has_value() {
                    continue;
                }
                if parent.is_checkpoint() {
                    if !recompute_subgraph(parent)? {
                        eprintln!(
                            "[checkpoint] failed to recompute parent {} of {}",
                            parent.label(),
                            node.label()
                        );
                        return Ok(false);
                    }
                } else {
                    eprintln!(
                        "[checkpoint] parent {} of {} has no value and is not checkpointed",
                        parent.label(),
                        node.label()
                    );
                    return Ok(false);
                }
            }
        }
    }

    let out = forward_eval_node(node)?;
    node.set_value(out);
    inplace::on_recomputed(node);
    Ok(true)
}

/// True when the node's value is materialized, recomputing it first if the
/// node is an evicted checkpoint.
pub fn ensure_value_present(node: &NodeRef) -> Result<bool> {
    if node.has_value() {
        return Ok(true);
    }
    if node.is_checkpoint() {
        return recompute_subgraph(node);
    }
    Ok(false)
}

/// Mark every `n`-th visited non-leaf node in a breadth-first traversal
/// from the root.
pub fn auto_checkpoint_every_n(root: &Value, n: usize) {
    if n == 0 {
        return;
    }
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeRef> = VecDeque::new();
    queue.push_back(Arc::clone(root.node()));
    let mut counter = 0usize;

    while let Some(cur) = queue.pop_front() {
        if !visited.insert(cur.id()) {
            continue;
        }
        counter += 1;
        if counter % n == 0 && !cur.inputs().is_empty() {
            mark_node_checkpoint(&cur, &CheckpointOptions::default());
        }
        for p in cur.inputs() {
            queue.push_back(Arc::clone(p));
        }
    }
}

/// Mark every non-leaf node at BFS depth >= `depth_threshold` from the root.
pub fn auto_checkpoint_by_depth(root: &Value, depth_threshold: usize) {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<(NodeRef, usize)> = VecDeque::new();
    queue.push_back((Arc::clone(root.node()), 0));

    while let Some((cur, depth)) = queue.pop_front() {
        if !visited.insert(cur.id()) {
            continue;
        }
        if depth >= depth_threshold && !cur.inputs().is_empty() {
            mark_node_checkpoint(&cur, &CheckpointOptions::default());
        }
        for p in cur.inputs() {
            queue.push_back((Arc::clone(p), depth + 1));
        }
    }
}
