//! Dynamic dataflow graph: nodes, op tags, values and topological order.
//!
//! A [`Node`] represents one tensor value in the graph. Children hold strong
//! references to their parents through `inputs`; the reverse direction is
//! never stored and is recovered on demand by [`topo_from`]. All mutable
//! per-node state (value, gradient, checkpoint metadata, tape) lives behind
//! an internal mutex so that a tracer or a diagnostic pass may observe nodes
//! from another thread, while differentiation sessions themselves are
//! serialized by the caller.

use remgrad_core::Dense2;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::debug;

/// Element type of the differentiation layer.
pub type Tensor = Dense2<f64>;

/// Shared handle to a graph node.
pub type NodeRef = Arc<Node>;

/// Operation tag. Determines which forward evaluator, VJP and JVP rule apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Input tensor (constant or parameter).
    Leaf,
    /// Elementwise addition with row/scalar broadcast.
    Add,
    /// Elementwise subtraction with row/scalar broadcast.
    Sub,
    /// Elementwise multiplication with row/scalar broadcast.
    Mul,
    /// Matrix multiplication.
    MatMul,
    /// Rectified linear unit.
    Relu,
    /// Gaussian error linear unit (tanh approximation).
    Gelu,
    /// Full reduction to a `1 x 1` sum.
    Sum,
    /// Full reduction to a `1 x 1` mean.
    Mean,
    /// Mean squared error against a target tensor.
    MseLoss,
    /// Cross entropy between logits and probability targets.
    CeWithLogits,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Leaf => "Leaf",
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::MatMul => "MatMul",
            Op::Relu => "Relu",
            Op::Gelu => "Gelu",
            Op::Sum => "Sum",
            Op::Mean => "Mean",
            Op::MseLoss => "MseLoss",
            Op::CeWithLogits => "CeWithLogits",
        };
        write!(f, "{}", name)
    }
}

/// Unique identifier for a node, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node #{}", self.0)
    }
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable per-node state, guarded by the node's mutex.
#[derive(Default)]
struct NodeState {
    /// Forward result; `None` means never evaluated or evicted.
    value: Option<Tensor>,
    /// Reverse-mode gradient accumulator.
    grad: Option<Tensor>,
    /// Whether reverse mode propagates through this node.
    requires_grad: bool,
    /// Whether this node is a recomputation boundary.
    is_checkpoint: bool,
    /// Snapshots of parent values, one slot per input. `Some` carries both
    /// occupancy and payload; `None` means the slot was recorded with no
    /// value available.
    saved_inputs: Vec<Option<Tensor>>,
    /// Opaque RNG state to restore before recomputation.
    saved_rng: Option<Vec<u8>>,
    /// Op-specific saved intermediates, cleared on eviction.
    tape: Vec<Tensor>,
}

/// One value in the dataflow graph.
pub struct Node {
    id: NodeId,
    op: Op,
    inputs: Vec<NodeRef>,
    debug_name: Option<String>,
    state: Mutex<NodeState>,
}

impl Node {
    /// Create a node, wire its inputs and notify the thread's node-created
    /// observer (if any).
    pub fn new(
        op: Op,
        inputs: Vec<NodeRef>,
        value: Option<Tensor>,
        requires_grad: bool,
        debug_name: Option<String>,
    ) -> NodeRef {
        let node = Arc::new(Node {
            id: NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)),
            op,
            inputs,
            debug_name,
            state: Mutex::new(NodeState {
                value,
                requires_grad,
                ..NodeState::default()
            }),
        });
        debug::notify_node_created(&node);
        node
    }

    /// Stable identifier assigned at creation.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Operation tag.
    pub fn op(&self) -> Op {
        self.op
    }

    /// Ordered parent references. Arity is op-specific.
    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    /// Optional short label.
    pub fn name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }

    /// Human-readable identity used in diagnostics and errors.
    pub fn label(&self) -> String {
        match &self.debug_name {
            Some(n) => format!("{} [{}] (\"{}\")", self.id, self.op, n),
            None => format!("{} [{}]", self.id, self.op),
        }
    }

    /// Current forward value, if materialized.
    pub fn value(&self) -> Option<Tensor> {
        self.state.lock().unwrap().value.clone()
    }

    /// True when the forward value is materialized.
    pub fn has_value(&self) -> bool {
        self.state.lock().unwrap().value.is_some()
    }

    /// Number of elements in the materialized value, 0 when missing.
    pub fn value_numel(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .value
            .as_ref()
            .map_or(0, Tensor::numel)
    }

    /// Replace the forward value.
    pub fn set_value(&self, value: Tensor) {
        self.state.lock().unwrap().value = Some(value);
    }

    /// Drop the forward value (eviction).
    pub fn clear_value(&self) {
        self.state.lock().unwrap().value = None;
    }

    /// Accumulated gradient, if any.
    pub fn grad(&self) -> Option<Tensor> {
        self.state.lock().unwrap().grad.clone()
    }

    /// Replace the gradient (seeding).
    pub fn set_grad(&self, grad: Tensor) {
        self.state.lock().unwrap().grad = Some(grad);
    }

    /// Drop the gradient.
    pub fn clear_grad(&self) {
        self.state.lock().unwrap().grad = None;
    }

    /// Add `contrib` elementwise into the gradient accumulator.
    ///
    /// No-op when the node does not require gradients.
    pub fn accumulate_grad(&self, contrib: &Tensor) {
        let mut st = self.state.lock().unwrap();
        if !st.requires_grad {
            return;
        }
        st.grad = Some(match st.grad.take() {
            Some(g) => &g + contrib,
            None => contrib.clone(),
        });
    }

    /// Whether reverse mode propagates through this node.
    pub fn requires_grad(&self) -> bool {
        self.state.lock().unwrap().requires_grad
    }

    /// Toggle gradient tracking.
    pub fn set_requires_grad(&self, on: bool) {
        self.state.lock().unwrap().requires_grad = on;
    }

    /// Whether this node is a recomputation boundary.
    pub fn is_checkpoint(&self) -> bool {
        self.state.lock().unwrap().is_checkpoint
    }

    pub(crate) fn set_checkpoint(&self, on: bool) {
        self.state.lock().unwrap().is_checkpoint = on;
    }

    /// Replace the input snapshots, one slot per input.
    pub fn set_saved_inputs(&self, slots: Vec<Option<Tensor>>) {
        self.state.lock().unwrap().saved_inputs = slots;
    }

    /// Snapshot for input slot `i`: `Some` when the slot is occupied.
    pub fn saved_input(&self, i: usize) -> Option<Tensor> {
        self.state
            .lock()
            .unwrap()
            .saved_inputs
            .get(i)
            .and_then(Clone::clone)
    }

    /// Number of recorded snapshot slots.
    pub fn saved_inputs_len(&self) -> usize {
        self.state.lock().unwrap().saved_inputs.len()
    }

    /// True when the node has been snapshotted (slots recorded).
    pub fn has_saved_inputs(&self) -> bool {
        !self.state.lock().unwrap().saved_inputs.is_empty()
    }

    /// Captured RNG state, if any.
    pub fn saved_rng(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().saved_rng.clone()
    }

    /// Store or drop the captured RNG state.
    pub fn set_saved_rng(&self, blob: Option<Vec<u8>>) {
        self.state.lock().unwrap().saved_rng = blob;
    }

    /// Append an op-specific intermediate to the tape.
    pub fn push_tape(&self, t: Tensor) {
        self.state.lock().unwrap().tape.push(t);
    }

    /// Number of tape entries.
    pub fn tape_len(&self) -> usize {
        self.state.lock().unwrap().tape.len()
    }

    /// Drop all tape entries (eviction).
    pub fn clear_tape(&self) {
        self.state.lock().unwrap().tape.clear();
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("inputs", &self.inputs.iter().map(|p| p.id).collect::<Vec<_>>())
            .field("name", &self.debug_name)
            .finish()
    }
}

/// Public handle to a graph value, cheap to clone.
#[derive(Clone)]
pub struct Value {
    node: NodeRef,
}

impl Value {
    /// Wrap an existing node.
    pub fn new(node: NodeRef) -> Self {
        Self { node }
    }

    /// The underlying node.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Identifier of the underlying node.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Forward value, if materialized.
    pub fn value(&self) -> Option<Tensor> {
        self.node.value()
    }

    /// Accumulated gradient, if any.
    pub fn grad(&self) -> Option<Tensor> {
        self.node.grad()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", self.node)
    }
}

/// Create a non-differentiable leaf.
pub fn constant(t: Tensor, name: &str) -> Value {
    make_tensor(t, name, false)
}

/// Create a differentiable leaf (parameter).
pub fn param(t: Tensor, name: &str) -> Value {
    make_tensor(t, name, true)
}

/// Create a leaf with explicit gradient tracking.
pub fn make_tensor(t: Tensor, name: &str, requires_grad: bool) -> Value {
    let name = if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    };
    Value::new(Node::new(Op::Leaf, Vec::new(), Some(t), requires_grad, name))
}

/// Topological order of all nodes reachable from `root` through inputs.
///
/// Parents appear strictly before children; each node appears once. The
/// order is deterministic: a depth-first traversal from the root visiting
/// inputs in declaration order, emitting on post-order.
pub fn topo_from(root: &NodeRef) -> Vec<NodeRef> {
    let mut order = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<(NodeRef, bool)> = vec![(Arc::clone(root), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        // Reversed push so that inputs[0] is explored first.
        for p in node.inputs().iter().rev() {
            if !visited.contains(&p.id()) {
                stack.push((Arc::clone(p), false));
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(v: f64, name: &str, rg: bool) -> Value {
        make_tensor(Tensor::from_elem(1, 1, v), name, rg)
    }

    #[test]
    fn test_leaf_constructors() {
        let c = constant(Tensor::zeros(2, 2), "c");
        let p = param(Tensor::zeros(2, 2), "p");
        assert!(!c.node().requires_grad());
        assert!(p.node().requires_grad());
        assert_eq!(c.node().op(), Op::Leaf);
        assert_eq!(p.node().name(), Some("p"));
    }

    #[test]
    fn test_node_ids_are_unique() {
        let a = leaf(1.0, "a", false);
        let b = leaf(2.0, "b", false);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_accumulate_grad_adds() {
        let p = param(Tensor::zeros(2, 2), "p");
        p.node().accumulate_grad(&Tensor::ones(2, 2));
        p.node().accumulate_grad(&Tensor::ones(2, 2));
        let g = p.grad().unwrap();
        assert_eq!(g[(0, 0)], 2.0);
    }

    #[test]
    fn test_accumulate_grad_ignores_frozen_nodes() {
        let c = constant(Tensor::zeros(2, 2), "c");
        c.node().accumulate_grad(&Tensor::ones(2, 2));
        assert!(c.grad().is_none());
    }

    #[test]
    fn test_topo_parents_before_children() {
        let a = leaf(1.0, "a", true);
        let b = leaf(2.0, "b", true);
        let c = Value::new(Node::new(
            Op::Add,
            vec![Arc::clone(a.node()), Arc::clone(b.node())],
            None,
            true,
            None,
        ));
        let d = Value::new(Node::new(
            Op::Mul,
            vec![Arc::clone(c.node()), Arc::clone(a.node())],
            None,
            true,
            None,
        ));

        let order = topo_from(d.node());
        let pos = |id: NodeId| order.iter().position(|n| n.id() == id).unwrap();

        assert_eq!(order.len(), 4);
        assert!(pos(a.id()) < pos(c.id()));
        assert!(pos(b.id()) < pos(c.id()));
        assert!(pos(c.id()) < pos(d.id()));
        assert_eq!(order.last().unwrap().id(), d.id());
    }

    #[test]
    fn test_topo_is_deterministic() {
        let a = leaf(1.0, "a", true);
        let b = leaf(2.0, "b", true);
        let c = Value::new(Node::new(
            Op::Add,
            vec![Arc::clone(a.node()), Arc::clone(b.node())],
            None,
            true,
            None,
        ));

        let first: Vec<NodeId> = topo_from(c.node()).iter().map(|n| n.id()).collect();
        let second: Vec<NodeId> = topo_from(c.node()).iter().map(|n| n.id()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_saved_input_slots() {
        let a = leaf(1.0, "a", false);
        let n = Node::new(Op::Relu, vec![Arc::clone(a.node())], None, false, None);
        assert!(!n.has_saved_inputs());

        n.set_saved_inputs(vec![Some(Tensor::ones(1, 1))]);
        assert!(n.has_saved_inputs());
        assert_eq!(n.saved_inputs_len(), 1);
        assert!(n.saved_input(0).is_some());
        assert!(n.saved_input(1).is_none());
    }
}
