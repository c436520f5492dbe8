//! Gradient-descent parameter updates over graph leaves.
//!
//! [`Sgd`] walks the graph reachable from a root and applies one update to
//! every differentiable leaf that has an accumulated gradient, with
//! optional momentum and decoupled weight decay. Updates mutate leaf values
//! in place and bump their versions in the in-place table.

use crate::graph::{topo_from, NodeId, Tensor, Value};
use crate::inplace;
use std::collections::HashMap;

/// Hyperparameters for [`Sgd`].
#[derive(Debug, Clone)]
pub struct SgdConfig {
    /// Step size.
    pub learning_rate: f64,
    /// Momentum coefficient; 0 disables the velocity buffer.
    pub momentum: f64,
    /// L2 penalty added to the gradient; 0 disables it.
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// Stochastic gradient descent over the parameters of a graph.
pub struct Sgd {
    config: SgdConfig,
    velocity: HashMap<NodeId, Tensor>,
}

impl Sgd {
    /// Plain SGD with the given learning rate.
    pub fn new(learning_rate: f64) -> Self {
        Self::with_config(SgdConfig {
            learning_rate,
            ..SgdConfig::default()
        })
    }

    /// SGD with explicit hyperparameters.
    pub fn with_config(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
        }
    }

    /// The active hyperparameters.
    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    /// Update every differentiable leaf reachable from `root` that carries
    /// a gradient. Returns the number of parameters stepped.
    pub fn step(&mut self, root: &Value) -> usize {
        let mut stepped = 0;
        for n in topo_from(root.node()) {
            if !n.inputs().is_empty() || !n.requires_grad() {
                continue;
            }
            let Some(grad) = n.grad() else {
                continue;
            };
            let Some(weights) = n.value() else {
                continue;
            };

            let mut update = grad;
            if self.config.weight_decay != 0.0 {
                update = &update + &weights.scale(self.config.weight_decay);
            }
            if self.config.momentum != 0.0 {
                let v = match self.velocity.get(&n.id()) {
                    Some(prev) => &prev.scale(self.config.momentum) + &update,
                    None => update.clone(),
                };
                self.velocity.insert(n.id(), v.clone());
                update = v;
            }

            n.set_value(&weights - &update.scale(self.config.learning_rate));
            inplace::bump_version(&n);
            stepped += 1;
        }
        stepped
    }
}
