//! Reverse-mode and forward-mode differentiation engines.
//!
//! `backward` walks the topological order in reverse, dispatching per-op VJP
//! rules that accumulate into parents' gradients, recomputing checkpointed
//! activations as it encounters holes. `jvp` walks the same order forward,
//! propagating tangents through per-op JVP rules in a single pass.

use crate::checkpoint;
use crate::debug;
use crate::error::AdError;
use crate::graph::{topo_from, NodeId, Tensor, Value};
use crate::jvp::jvp_lookup;
use crate::vjp::vjp_lookup;
use anyhow::{bail, Result};
use std::collections::HashMap;

/// Zero the gradient of every reachable node that requires one.
pub fn zero_grad(root: &Value) {
    for n in topo_from(root.node()) {
        if !n.requires_grad() {
            continue;
        }
        match n.value() {
            Some(v) => n.set_grad(v.zeros_like()),
            None => n.clear_grad(),
        }
    }
}

/// Reverse-mode backpropagation from `root`.
///
/// The root's gradient is seeded with `grad_seed` when given, otherwise with
/// ones shaped like its value (a `1 x 1` ones tensor for scalars). Rules
/// accumulate into parents, so leaves collect contributions from every path.
///
/// Checkpointed activations missing at traversal time are regenerated
/// through the checkpoint subsystem; a missing activation on a
/// non-checkpointed node is fatal.
pub fn backward(root: &Value, grad_seed: Option<&Tensor>) -> Result<()> {
    let order = topo_from(root.node());

    if root.node().requires_grad() {
        let seed = match grad_seed {
            Some(s) => s.clone(),
            None => match root.value() {
                Some(v) if v.is_scalar() => Tensor::ones(1, 1),
                Some(v) => v.ones_like(),
                None => {
                    return Err(AdError::RootValueMissing {
                        node: root.node().label(),
                    }
                    .into())
                }
            },
        };
        root.node().set_grad(seed);
    }

    for n in order.iter().rev() {
        if !n.requires_grad() || n.inputs().is_empty() {
            continue;
        }
        // Nothing flowed into this node (e.g. a skipped rule downstream).
        let Some(gy) = n.grad() else {
            continue;
        };

        debug::on_backprop_step(n, &gy);

        if n.is_checkpoint() {
            if !n.has_value() {
                if !checkpoint::recompute_subgraph(n)? {
                    return Err(AdError::RecomputeFailed { node: n.label() }.into());
                }
            } else {
                // A live boundary checkpoint may still have evicted parents;
                // its own snapshots bring them back.
                checkpoint::restore_missing_inputs(n)?;
            }
        }

        for p in n.inputs() {
            if p.has_value() {
                continue;
            }
            if p.is_checkpoint() {
                if !checkpoint::recompute_subgraph(p)? {
                    return Err(AdError::RecomputeFailed { node: p.label() }.into());
                }
            } else {
                return Err(AdError::MissingActivation {
                    consumer: n.label(),
                    producer: p.label(),
                }
                .into());
            }
        }

        match vjp_lookup(n.op()) {
            Some(rule) => {
                if let Err(e) = rule(n, &gy) {
                    return Err(AdError::VjpFailed {
                        node: n.label(),
                        cause: e,
                    }
                    .into());
                }
            }
            None => {
                eprintln!(
                    "[backward] WARNING: no VJP registered for op {} at {}",
                    n.op(),
                    n.label()
                );
                continue;
            }
        }
    }

    Ok(())
}

/// Forward-mode differentiation: propagate seed tangents from `seeds`
/// through the graph and return the root's tangent.
///
/// Unseeded nodes start from zeros shaped like their value, so an empty
/// seed map yields a zero tangent at the root.
pub fn jvp(root: &Value, seeds: &HashMap<NodeId, Tensor>) -> Result<Tensor> {
    let order = topo_from(root.node());
    let mut tangents: HashMap<NodeId, Tensor> = HashMap::with_capacity(order.len());

    for n in &order {
        let mut t = match seeds.get(&n.id()) {
            Some(s) => s.clone(),
            None => match n.value() {
                Some(v) => v.zeros_like(),
                None => bail!("{} has no value during jvp; run the forward pass first", n.label()),
            },
        };

        debug::on_jvp_step(n);

        if !n.inputs().is_empty() {
            match jvp_lookup(n.op()) {
                Some(rule) => {
                    let parent_tangents: Vec<Tensor> = n
                        .inputs()
                        .iter()
                        .map(|p| {
                            tangents.get(&p.id()).cloned().unwrap_or_else(|| {
                                p.value()
                                    .map(|v| v.zeros_like())
                                    .unwrap_or_else(|| Tensor::zeros(1, 1))
                            })
                        })
                        .collect();
                    t = rule(n, &parent_tangents)?;
                }
                None => {
                    eprintln!(
                        "[jvp] WARNING: no JVP registered for op {} at {}",
                        n.op(),
                        n.label()
                    );
                }
            }
        }

        tangents.insert(n.id(), t);
    }

    Ok(tangents.remove(&root.id()).unwrap())
}
