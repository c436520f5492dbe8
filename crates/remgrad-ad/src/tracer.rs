//! Thread-scoped capture of node creation.
//!
//! A [`Tracer`] installs itself on the current thread's node-created
//! observer stack and records every node built until it is stopped:
//! insertion order is preserved, duplicates are dropped by node identity,
//! and the captured subgraph can be topologically sorted afterwards.
//!
//! `start`/`stop` pairs are strictly LIFO; nested tracers compose, with the
//! most recently started one receiving events. [`CaptureGuard`] pairs them
//! through RAII. The tracer's own state sits behind a mutex, so a capture
//! may be inspected from another thread while the capturing thread keeps
//! running.

use crate::debug;
use crate::graph::{NodeId, NodeRef};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct TracerInner {
    /// Captured nodes in insertion order.
    order: Vec<NodeRef>,
    /// Dedup by node identity.
    seen: HashSet<NodeId>,
    /// Explicitly marked outputs.
    outputs: HashSet<NodeId>,
}

/// Records nodes created inside a scoped region. Cheap to clone; clones
/// share the captured state.
#[derive(Clone, Default)]
pub struct Tracer {
    inner: Arc<Mutex<TracerInner>>,
}

/// Create a fresh tracer.
pub fn make_tracer() -> Tracer {
    Tracer::default()
}

impl Tracer {
    fn record(inner: &Mutex<TracerInner>, n: &NodeRef) {
        let mut st = inner.lock().unwrap();
        if st.seen.insert(n.id()) {
            st.order.push(Arc::clone(n));
        }
    }

    /// Install this tracer as the current thread's top observer.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        debug::push_node_created_callback(move |n| Tracer::record(&inner, n));
    }

    /// Remove the top observer from the current thread's stack.
    pub fn stop(&self) {
        debug::pop_node_created_callback();
    }

    /// Observer hook; records the node once, keeping insertion order.
    pub fn on_node_created(&self, n: &NodeRef) {
        Tracer::record(&self.inner, n);
    }

    /// Drop all captured state.
    pub fn clear(&self) {
        let mut st = self.inner.lock().unwrap();
        st.order.clear();
        st.seen.clear();
        st.outputs.clear();
    }

    /// Captured nodes in insertion order.
    pub fn captured_nodes(&self) -> Vec<NodeRef> {
        self.inner.lock().unwrap().order.clone()
    }

    /// Record an explicit output of the capture.
    pub fn mark_output(&self, n: &NodeRef) {
        self.inner.lock().unwrap().outputs.insert(n.id());
    }

    /// Outputs of the capture.
    ///
    /// Explicitly marked outputs are returned in capture order. When none
    /// were marked, the sinks of the captured subgraph are detected: every
    /// captured node not consumed as an input by another captured node.
    /// A trivial capture with no sinks falls back to the last captured node.
    pub fn outputs(&self) -> Vec<NodeRef> {
        let st = self.inner.lock().unwrap();

        if !st.outputs.is_empty() {
            return st
                .order
                .iter()
                .filter(|n| st.outputs.contains(&n.id()))
                .cloned()
                .collect();
        }

        let mut has_consumer: HashSet<NodeId> = HashSet::new();
        for n in &st.order {
            for p in n.inputs() {
                has_consumer.insert(p.id());
            }
        }
        let sinks: Vec<NodeRef> = st
            .order
            .iter()
            .filter(|n| !has_consumer.contains(&n.id()))
            .cloned()
            .collect();
        if sinks.is_empty() {
            return st.order.last().cloned().into_iter().collect();
        }
        sinks
    }

    /// Topological order of the captured subgraph: each node's captured
    /// inputs appear strictly before it.
    ///
    /// Depth-first from each detected output over inputs filtered to the
    /// captured set, emitting on post-order; nodes unreachable from any
    /// output are appended afterwards so none are dropped.
    pub fn topo_sort(&self) -> Vec<NodeRef> {
        let order_copy = self.captured_nodes();
        if order_copy.is_empty() {
            return Vec::new();
        }

        let captured: HashSet<NodeId> = order_copy.iter().map(|n| n.id()).collect();
        let outs = self.outputs();

        let mut result: Vec<NodeRef> = Vec::with_capacity(order_copy.len());
        let mut visited: HashSet<NodeId> = HashSet::new();

        let mut visit = |start: &NodeRef, result: &mut Vec<NodeRef>, visited: &mut HashSet<NodeId>| {
            let mut stack: Vec<(NodeRef, bool)> = vec![(Arc::clone(start), false)];
            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    result.push(node);
                    continue;
                }
                if !visited.insert(node.id()) {
                    continue;
                }
                stack.push((Arc::clone(&node), true));
                for p in node.inputs().iter().rev() {
                    if captured.contains(&p.id()) && !visited.contains(&p.id()) {
                        stack.push((Arc::clone(p), false));
                    }
                }
            }
        };

        for out in &outs {
            visit(out, &mut result, &mut visited);
        }
        for n in &order_copy {
            if !visited.contains(&n.id()) {
                visit(n, &mut result, &mut visited);
            }
        }

        result
    }
}

/// RAII capture scope: starts the tracer on construction, stops it on drop.
pub struct CaptureGuard {
    tracer: Tracer,
}

impl CaptureGuard {
    /// Begin capturing on the current thread.
    pub fn new(tracer: Tracer) -> Self {
        tracer.start();
        Self { tracer }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.tracer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{constant, param, Tensor};
    use crate::ops::{add, matmul, relu, sum};

    #[test]
    fn test_capture_records_in_insertion_order() {
        let tracer = make_tracer();
        let (a, b, c);
        {
            let _guard = CaptureGuard::new(tracer.clone());
            a = param(Tensor::ones(1, 2), "a");
            b = param(Tensor::ones(1, 2), "b");
            c = add(&a, &b);
        }
        let ids: Vec<_> = tracer.captured_nodes().iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);

        // Nodes created after the scope are not captured.
        let _ = relu(&c);
        assert_eq!(tracer.captured_nodes().len(), 3);
    }

    #[test]
    fn test_dedup_by_identity() {
        let tracer = make_tracer();
        let x = constant(Tensor::ones(1, 1), "x");
        tracer.on_node_created(x.node());
        tracer.on_node_created(x.node());
        assert_eq!(tracer.captured_nodes().len(), 1);
    }

    #[test]
    fn test_detected_outputs_are_sinks() {
        let tracer = make_tracer();
        let loss;
        {
            let _guard = CaptureGuard::new(tracer.clone());
            let x = constant(Tensor::ones(2, 2), "x");
            let w = param(Tensor::ones(2, 2), "w");
            loss = sum(&matmul(&x, &w));
        }
        let outs = tracer.outputs();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].id(), loss.id());
    }

    #[test]
    fn test_explicit_outputs_take_precedence() {
        let tracer = make_tracer();
        let h;
        {
            let _guard = CaptureGuard::new(tracer.clone());
            let x = constant(Tensor::ones(2, 2), "x");
            h = relu(&x);
            let _loss = sum(&h);
            tracer.mark_output(h.node());
        }
        let outs = tracer.outputs();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].id(), h.id());
    }

    #[test]
    fn test_topo_sort_lists_inputs_first() {
        let tracer = make_tracer();
        let (x, loss);
        {
            let _guard = CaptureGuard::new(tracer.clone());
            x = param(Tensor::ones(2, 2), "x");
            let h = relu(&x);
            loss = sum(&h);
        }
        let topo = tracer.topo_sort();
        assert_eq!(topo.len(), 3);
        assert_eq!(topo.first().unwrap().id(), x.id());
        assert_eq!(topo.last().unwrap().id(), loss.id());
    }

    #[test]
    fn test_topo_sort_appends_unreachable_nodes() {
        let tracer = make_tracer();
        let stray;
        {
            let _guard = CaptureGuard::new(tracer.clone());
            let x = constant(Tensor::ones(1, 1), "x");
            let loss = sum(&x);
            tracer.mark_output(loss.node());
            stray = constant(Tensor::ones(1, 1), "stray");
        }
        let topo = tracer.topo_sort();
        assert_eq!(topo.len(), 3);
        assert!(topo.iter().any(|n| n.id() == stray.id()));
    }

    #[test]
    fn test_nested_tracers_compose() {
        let outer = make_tracer();
        let inner = make_tracer();
        {
            let _outer_guard = CaptureGuard::new(outer.clone());
            let _a = constant(Tensor::ones(1, 1), "a");
            {
                let _inner_guard = CaptureGuard::new(inner.clone());
                let _b = constant(Tensor::ones(1, 1), "b");
            }
            let _c = constant(Tensor::ones(1, 1), "c");
        }
        // The inner tracer shadowed the outer one for b only.
        assert_eq!(inner.captured_nodes().len(), 1);
        assert_eq!(outer.captured_nodes().len(), 2);
    }

    #[test]
    fn test_clear_resets_everything() {
        let tracer = make_tracer();
        {
            let _guard = CaptureGuard::new(tracer.clone());
            let x = constant(Tensor::ones(1, 1), "x");
            tracer.mark_output(x.node());
        }
        tracer.clear();
        assert!(tracer.captured_nodes().is_empty());
        assert!(tracer.outputs().is_empty());
        assert!(tracer.topo_sort().is_empty());
    }
}
