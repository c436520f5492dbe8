//! Train a small dense network with activation checkpointing.
//!
//! Builds an MLP, marks checkpoints, evicts intermediate activations
//! between the forward and backward passes, and lets backward regenerate
//! whatever it needs while SGD updates the parameters.

use anyhow::Result;
use remgrad_ad::checkpoint::EvictionStats;
use remgrad_ad::optim::Sgd;
use remgrad_ad::prelude::*;

fn activation_bytes(root: &Value) -> usize {
    topo_from(root.node())
        .iter()
        .map(|n| n.value_numel() * std::mem::size_of::<f64>())
        .sum()
}

fn main() -> Result<()> {
    let batch = 32;
    let in_dim = 16;
    let hidden = 64;
    let depth = 6;

    let x = constant(Tensor::randn(batch, in_dim, 1), "x");
    let y = constant(Tensor::randn(batch, 1, 2), "y");

    let mut weights = Vec::new();
    for i in 0..depth {
        let rows = if i == 0 { in_dim } else { hidden };
        weights.push(param(Tensor::randn(rows, hidden, 10 + i as u64).scale(0.1), &format!("W{}", i)));
    }
    let w_out = param(Tensor::randn(hidden, 1, 99).scale(0.1), "Wout");

    let mut opt = Sgd::new(1e-3);

    for epoch in 0..5 {
        let mut cur = x.clone();
        for w in &weights {
            cur = gelu(&matmul(&cur, w));
        }
        let loss = mse_loss(&matmul(&cur, &w_out), &y);

        // Checkpoint everything, snapshot, and drop the live range.
        auto_checkpoint_every_n(&loss, 1);
        capture_checkpoint_snapshots(&loss);
        let before = activation_bytes(&loss);
        let EvictionStats {
            cleared_nodes,
            cleared_bytes,
        } = evict_non_checkpoint_values(&loss);
        let after = activation_bytes(&loss);

        zero_grad(&loss);
        backward(&loss, None)?;
        let stepped = opt.step(&loss);

        println!(
            "epoch {}: loss={:.6} activations {:.1} KB -> {:.1} KB (freed {} nodes, {:.1} KB), {} params updated",
            epoch,
            loss.value().map(|t| t.scalar().unwrap_or(f64::NAN)).unwrap_or(f64::NAN),
            before as f64 / 1024.0,
            after as f64 / 1024.0,
            cleared_nodes,
            cleared_bytes as f64 / 1024.0,
            stepped,
        );
    }

    Ok(())
}
