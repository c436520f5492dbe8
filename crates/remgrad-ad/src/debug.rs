//! Debug and trace hooks.
//!
//! The node-created observer stack is the sole coupling between op
//! constructors and the tracer/diagnostic subsystems: constructors call
//! [`notify_node_created`], which dispatches to the most recently pushed
//! callback on the current thread. The stack is strictly LIFO and pairing
//! push/pop is the caller's responsibility.
//!
//! The rest of the module is printing utilities and step hooks consumed by
//! the engines: one line per node during backward or JVP when the matching
//! toggle is on, plus GraphViz export of the forward graph.

use crate::graph::{topo_from, Node, NodeRef, Tensor, Value};
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Callback invoked when a node is created on this thread.
pub type NodeCreatedCb = Rc<dyn Fn(&NodeRef)>;

thread_local! {
    static NODE_CREATED_STACK: RefCell<Vec<NodeCreatedCb>> = const { RefCell::new(Vec::new()) };
}

static NODE_TRACING: AtomicBool = AtomicBool::new(false);
static GRAD_TRACING: AtomicBool = AtomicBool::new(false);
static JVP_TRACING: AtomicBool = AtomicBool::new(false);
static MAX_PRINT_ROWS: AtomicUsize = AtomicUsize::new(8);
static MAX_PRINT_COLS: AtomicUsize = AtomicUsize::new(8);

/// Print each node as it is created.
pub fn enable_tracing(on: bool) {
    NODE_TRACING.store(on, Ordering::Relaxed);
}

/// Print one line per node visited during `backward`.
pub fn enable_grad_tracing(on: bool) {
    GRAD_TRACING.store(on, Ordering::Relaxed);
}

/// Print one line per node visited during `jvp`.
pub fn enable_jvp_tracing(on: bool) {
    JVP_TRACING.store(on, Ordering::Relaxed);
}

/// Truncation limits for tensor printing.
pub fn set_print_limits(max_rows: usize, max_cols: usize) {
    MAX_PRINT_ROWS.store(max_rows, Ordering::Relaxed);
    MAX_PRINT_COLS.store(max_cols, Ordering::Relaxed);
}

pub(crate) fn node_tracing_enabled() -> bool {
    NODE_TRACING.load(Ordering::Relaxed)
}

/// Push a node-created callback onto this thread's observer stack.
///
/// The most recently pushed callback receives each event.
pub fn push_node_created_callback(cb: impl Fn(&NodeRef) + 'static) {
    NODE_CREATED_STACK.with(|s| s.borrow_mut().push(Rc::new(cb)));
}

/// Pop the top observer. Returns false when the stack was empty.
pub fn pop_node_created_callback() -> bool {
    NODE_CREATED_STACK.with(|s| s.borrow_mut().pop().is_some())
}

/// Current depth of this thread's observer stack.
pub fn observer_depth() -> usize {
    NODE_CREATED_STACK.with(|s| s.borrow().len())
}

/// Dispatch a creation event to the top-of-stack observer.
///
/// The callback is cloned out before invocation so an observer may itself
/// create nodes without re-entering the stack borrow.
pub(crate) fn notify_node_created(n: &NodeRef) {
    if NODE_TRACING.load(Ordering::Relaxed) {
        eprintln!(
            "[trace] created {} inputs={} requires_grad={}",
            n,
            n.inputs().len(),
            n.requires_grad()
        );
    }
    let top = NODE_CREATED_STACK.with(|s| s.borrow().last().cloned());
    if let Some(cb) = top {
        cb(n);
    }
}

/// Called once per node during `backward` when grad tracing is on.
pub fn on_backprop_step(n: &Node, gy: &Tensor) {
    if GRAD_TRACING.load(Ordering::Relaxed) {
        eprintln!(
            "[backward] {} gy={}x{}",
            n,
            gy.rows(),
            gy.cols()
        );
    }
}

/// Called once per node during `jvp` when JVP tracing is on.
pub fn on_jvp_step(n: &Node) {
    if JVP_TRACING.load(Ordering::Relaxed) {
        eprintln!("[jvp] {}", n);
    }
}

fn format_tensor(t: &Tensor) -> String {
    let max_rows = MAX_PRINT_ROWS.load(Ordering::Relaxed);
    let max_cols = MAX_PRINT_COLS.load(Ordering::Relaxed);
    let (rows, cols) = t.shape();
    let mut out = format!("{}x{} [", rows, cols);
    for i in 0..rows.min(max_rows) {
        out.push_str("\n  ");
        for j in 0..cols.min(max_cols) {
            let _ = write!(out, "{:>10.4} ", t[(i, j)]);
        }
        if cols > max_cols {
            out.push_str("...");
        }
    }
    if rows > max_rows {
        out.push_str("\n  ...");
    }
    out.push_str("\n]");
    out
}

/// Print a labeled tensor, truncated to the configured limits.
pub fn print_tensor(label: &str, t: &Tensor) {
    println!("{} = {}", label, format_tensor(t));
}

/// Print a value's forward tensor, or `(empty)` when missing.
pub fn print_value(label: &str, v: &Value) {
    match v.value() {
        Some(t) => print_tensor(label, &t),
        None => println!("{} = (empty)", label),
    }
}

/// Print a value's gradient, or `(none)` when missing.
pub fn print_grad(label: &str, v: &Value) {
    match v.grad() {
        Some(t) => print_tensor(label, &t),
        None => println!("{} = (none)", label),
    }
}

/// Print all reachable forward values in topological order.
pub fn print_all_values(root: &Value) {
    for n in topo_from(root.node()) {
        match n.value() {
            Some(t) => print_tensor(&n.label(), &t),
            None => println!("{} = (empty)", n.label()),
        }
    }
}

/// Print all reachable gradients in topological order.
pub fn print_all_grads(root: &Value) {
    for n in topo_from(root.node()) {
        match n.grad() {
            Some(t) => print_tensor(&format!("d{}", n.label()), &t),
            None => println!("d{} = (none)", n.label()),
        }
    }
}

/// Write the forward graph reachable from `root` as a GraphViz `.dot` file.
pub fn dump_dot(root: &Value, path: impl AsRef<Path>) -> Result<()> {
    let mut dot = String::from("digraph remgrad {\n  rankdir=BT;\n");
    let order = topo_from(root.node());
    for n in &order {
        let shape = n
            .value()
            .map(|t| format!("{}x{}", t.rows(), t.cols()))
            .unwrap_or_else(|| "empty".to_string());
        let name = n.name().unwrap_or("");
        let _ = writeln!(
            dot,
            "  n{} [label=\"{}\\n{} {}\"{}];",
            n.id().0,
            n.op(),
            name,
            shape,
            if n.is_checkpoint() {
                " style=filled fillcolor=lightblue"
            } else {
                ""
            }
        );
    }
    for n in &order {
        for p in n.inputs() {
            let _ = writeln!(dot, "  n{} -> n{};", p.id().0, n.id().0);
        }
    }
    dot.push_str("}\n");

    let path = path.as_ref();
    std::fs::write(path, dot).with_context(|| format!("writing dot file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{constant, make_tensor};
    use std::cell::Cell;

    #[test]
    fn test_observer_stack_is_lifo() {
        let before = observer_depth();
        push_node_created_callback(|_| {});
        push_node_created_callback(|_| {});
        assert_eq!(observer_depth(), before + 2);
        assert!(pop_node_created_callback());
        assert!(pop_node_created_callback());
        assert_eq!(observer_depth(), before);
    }

    #[test]
    fn test_top_of_stack_receives_events() {
        let hits = Rc::new(Cell::new(0u32));
        let shadowed = Rc::new(Cell::new(0u32));

        let s = Rc::clone(&shadowed);
        push_node_created_callback(move |_| s.set(s.get() + 1));
        let h = Rc::clone(&hits);
        push_node_created_callback(move |_| h.set(h.get() + 1));

        let _ = constant(Tensor::ones(1, 1), "probe");

        pop_node_created_callback();
        pop_node_created_callback();

        assert_eq!(hits.get(), 1);
        assert_eq!(shadowed.get(), 0);
    }

    #[test]
    fn test_pop_on_empty_stack() {
        while pop_node_created_callback() {}
        assert!(!pop_node_created_callback());
    }

    #[test]
    fn test_dump_dot_writes_nodes_and_edges() {
        let x = make_tensor(Tensor::ones(2, 2), "x", true);
        let y = crate::ops::relu(&x);

        let path = std::env::temp_dir().join(format!("remgrad_dot_{}.dot", y.id().0));
        dump_dot(&y, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(text.contains("digraph"));
        assert!(text.contains(&format!("n{}", x.id().0)));
        assert!(text.contains(&format!("n{} -> n{}", x.id().0, y.id().0)));
    }
}
