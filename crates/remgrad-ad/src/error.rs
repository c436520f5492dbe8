//! Typed error kinds for the differentiation engines.
//!
//! Fatal engine failures are expressed as [`AdError`] variants carrying node
//! identities, wrapped in `anyhow::Error` at the public surface so callers
//! can either display them or downcast for programmatic matching.

use thiserror::Error;

/// Errors raised by `backward`, `jvp` and the checkpoint subsystem.
#[derive(Error, Debug)]
pub enum AdError {
    /// A parent activation was empty and the parent is not a checkpoint, so
    /// it cannot be regenerated.
    #[error("activation missing for {producer}, required by {consumer}, and the node is not checkpointed")]
    MissingActivation {
        /// The node whose VJP needed the activation.
        consumer: String,
        /// The node whose value is gone.
        producer: String,
    },

    /// `recompute_subgraph` could not restore a checkpointed value.
    #[error("failed to recompute checkpointed node {node}")]
    RecomputeFailed {
        /// The checkpoint that could not be regenerated.
        node: String,
    },

    /// A VJP rule failed while accumulating into parents.
    #[error("VJP rule failed at {node}: {cause}")]
    VjpFailed {
        /// The node whose rule raised.
        node: String,
        /// The underlying failure.
        cause: anyhow::Error,
    },

    /// The root of a differentiation call had no materialized value and no
    /// explicit seed to take a shape from.
    #[error("root {node} has no value; evaluate the graph or supply a seed")]
    RootValueMissing {
        /// The differentiation root.
        node: String,
    },
}
