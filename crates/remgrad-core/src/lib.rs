//! # remgrad-core
//!
//! Dense 2-D tensor type for the remgrad differentiation stack.
//!
//! This crate provides the storage layer the graph engine builds on:
//!
//! - **Dense matrices** ([`Dense2`]) with row-major storage
//! - **Broadcasting arithmetic** for row-vector and scalar operands
//! - **Reductions** (sum, mean, row/column sums) used by gradient rules
//! - **Seeded random constructors** for reproducible test fixtures
//!
//! ## SciRS2 Integration
//!
//! This crate uses `scirs2-core` for all scientific computing operations;
//! arrays come from `scirs2_core::ndarray_ext` and random sampling from
//! `scirs2_core::random`.
//!
//! ## Quick Start
//!
//! ```
//! use remgrad_core::Dense2;
//!
//! let a = Dense2::<f64>::ones(2, 3);
//! let b = Dense2::<f64>::from_elem(1, 3, 0.5);
//!
//! // Row-vector broadcast, like adding a bias row
//! let c = &a + &b;
//! assert_eq!(c.shape(), (2, 3));
//! assert_eq!(c[(0, 0)], 1.5);
//! ```

pub mod dense;


pub use dense::Dense2;
