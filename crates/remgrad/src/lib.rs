//! # remgrad
//!
//! Checkpointed automatic differentiation over dense 2-D tensors.
//!
//! This is the meta crate that re-exports the remgrad components:
//!
//! - [`core`]: the dense tensor type ([`core::Dense2`])
//! - [`ad`]: the dataflow graph, reverse/forward engines, checkpoint
//!   subsystem, tracer and training utilities
//!
//! ## Quick Start
//!
//! ```
//! use remgrad::prelude::*;
//!
//! // loss = sum(relu(x @ w))
//! let x = constant(Tensor::randn(4, 3, 1), "x");
//! let w = param(Tensor::randn(3, 2, 2), "w");
//! let loss = sum(&relu(&matmul(&x, &w)));
//!
//! backward(&loss, None)?;
//! assert!(w.grad().is_some());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Checkpointing
//!
//! ```
//! use remgrad::prelude::*;
//!
//! let x = param(Tensor::randn(4, 4, 1), "x");
//! let mut cur = x.clone();
//! for _ in 0..6 {
//!     cur = relu(&cur);
//! }
//! let loss = sum(&cur);
//!
//! // Snapshot every node, free everything behind the boundaries, and let
//! // backward regenerate what it needs.
//! auto_checkpoint_every_n(&loss, 1);
//! capture_checkpoint_snapshots(&loss);
//! evict_non_checkpoint_values(&loss);
//! backward(&loss, None)?;
//! assert!(x.grad().is_some());
//! # Ok::<(), anyhow::Error>(())
//! ```

/// Dense tensor types.
pub mod core {
    pub use remgrad_core::*;
}

/// Differentiation engines and graph tooling.
pub mod ad {
    pub use remgrad_ad::*;
}

/// One-stop imports for applications and tests.
pub mod prelude {
    pub use remgrad_ad::prelude::*;
    pub use remgrad_core::Dense2;
}
