//! # remgrad-ad
//!
//! Reverse/forward-mode automatic differentiation with activation
//! checkpointing and on-demand recomputation.
//!
//! This crate provides:
//! - A dynamic dataflow graph built while evaluating tensor expressions
//! - Reverse-mode backpropagation (`backward`) via per-op VJP rules
//! - Forward-mode differentiation (`jvp`) via per-op JVP rules
//! - A checkpoint subsystem that snapshots inputs, evicts non-checkpoint
//!   activations and transparently regenerates them during backward
//! - A thread-scoped tracer capturing node creation inside a region
//!
//! # Example
//!
//! ```
//! use remgrad_ad::prelude::*;
//!
//! let x = constant(Tensor::randn(4, 3, 7), "x");
//! let w = param(Tensor::randn(3, 2, 8), "w");
//! let loss = sum(&matmul(&x, &w));
//!
//! backward(&loss, None).unwrap();
//! assert!(w.grad().is_some());
//! ```

pub mod autodiff;
pub mod checkpoint;
pub mod debug;
pub mod error;
pub mod graph;
pub mod inplace;
pub mod jvp;
pub mod memory;
pub mod ops;
pub mod optim;
pub mod rng;
pub mod tracer;
pub mod vjp;

pub use autodiff::{backward, jvp, zero_grad};
pub use checkpoint::{
    auto_checkpoint_by_depth, auto_checkpoint_every_n, capture_checkpoint_snapshots,
    compute_forward_values, ensure_value_present, evict_non_checkpoint_values, is_checkpointed,
    mark_node_checkpoint, recompute_subgraph, CheckpointOptions, EvictionStats,
};
pub use error::AdError;
pub use graph::{constant, make_tensor, param, topo_from, Node, NodeId, NodeRef, Op, Tensor, Value};
pub use tracer::{make_tracer, CaptureGuard, Tracer};

/// Convenience re-exports for downstream code and tests.
pub mod prelude {
    pub use crate::autodiff::{backward, jvp, zero_grad};
    pub use crate::checkpoint::{
        auto_checkpoint_by_depth, auto_checkpoint_every_n, capture_checkpoint_snapshots,
        compute_forward_values, evict_non_checkpoint_values, mark_node_checkpoint,
        CheckpointOptions,
    };
    pub use crate::graph::{constant, make_tensor, param, topo_from, Op, Tensor, Value};
    pub use crate::ops::{
        add, cross_entropy_with_logits, gelu, matmul, mean, mse_loss, mul, relu, sub, sum,
    };
    pub use crate::tracer::{make_tracer, CaptureGuard};
}
