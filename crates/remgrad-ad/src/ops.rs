//! Op constructors and forward evaluation.
//!
//! Constructors build graph nodes and evaluate them eagerly whenever every
//! input is materialized; a node whose inputs carry holes is created with an
//! empty value and filled later by `compute_forward_values` or checkpoint
//! recomputation. [`forward_eval_node`] is the single forward evaluator the
//! engines call: a pure function of a node's op tag and its inputs' current
//! values.
//!
//! Binary elementwise ops broadcast a `1 x C` row or a `1 x 1` scalar
//! against an `R x C` operand on either side, which covers the bias-add
//! pattern of dense layers.

use crate::graph::{Node, NodeRef, Op, Tensor, Value};
use anyhow::{bail, Result};
use std::sync::Arc;

/// Build a non-leaf node, evaluating eagerly when inputs are materialized.
fn new_op_node(op: Op, inputs: Vec<NodeRef>, name: Option<String>) -> Value {
    let requires_grad = inputs.iter().any(|p| p.requires_grad());
    let tensors: Option<Vec<Tensor>> = inputs.iter().map(|p| p.value()).collect();
    let value = tensors.map(|ts| match eval_op(op, &ts) {
        Ok(v) => v,
        Err(e) => panic!("forward evaluation of {} failed: {}", op, e),
    });
    Value::new(Node::new(op, inputs, value, requires_grad, name))
}

/// Elementwise addition with row/scalar broadcast.
pub fn add(a: &Value, b: &Value) -> Value {
    new_op_node(Op::Add, vec![Arc::clone(a.node()), Arc::clone(b.node())], None)
}

/// Elementwise subtraction with row/scalar broadcast.
pub fn sub(a: &Value, b: &Value) -> Value {
    new_op_node(Op::Sub, vec![Arc::clone(a.node()), Arc::clone(b.node())], None)
}

/// Elementwise multiplication with row/scalar broadcast.
pub fn mul(a: &Value, b: &Value) -> Value {
    new_op_node(Op::Mul, vec![Arc::clone(a.node()), Arc::clone(b.node())], None)
}

/// Matrix product.
pub fn matmul(a: &Value, b: &Value) -> Value {
    new_op_node(
        Op::MatMul,
        vec![Arc::clone(a.node()), Arc::clone(b.node())],
        None,
    )
}

/// Rectified linear unit.
pub fn relu(x: &Value) -> Value {
    new_op_node(Op::Relu, vec![Arc::clone(x.node())], None)
}

/// Gaussian error linear unit (tanh approximation).
pub fn gelu(x: &Value) -> Value {
    new_op_node(Op::Gelu, vec![Arc::clone(x.node())], None)
}

/// Sum of all elements, producing a `1 x 1` scalar.
pub fn sum(x: &Value) -> Value {
    new_op_node(Op::Sum, vec![Arc::clone(x.node())], None)
}

/// Mean of all elements, producing a `1 x 1` scalar.
pub fn mean(x: &Value) -> Value {
    new_op_node(Op::Mean, vec![Arc::clone(x.node())], None)
}

/// Mean squared error between `pred` and `target`, producing a scalar.
pub fn mse_loss(pred: &Value, target: &Value) -> Value {
    new_op_node(
        Op::MseLoss,
        vec![Arc::clone(pred.node()), Arc::clone(target.node())],
        None,
    )
}

/// Cross entropy between row-wise `logits` and probability `targets`,
/// averaged over rows, producing a scalar.
pub fn cross_entropy_with_logits(logits: &Value, targets: &Value) -> Value {
    new_op_node(
        Op::CeWithLogits,
        vec![Arc::clone(logits.node()), Arc::clone(targets.node())],
        None,
    )
}

impl std::ops::Add for &Value {
    type Output = Value;

    fn add(self, rhs: Self) -> Value {
        crate::ops::add(self, rhs)
    }
}

impl std::ops::Sub for &Value {
    type Output = Value;

    fn sub(self, rhs: Self) -> Value {
        crate::ops::sub(self, rhs)
    }
}

impl std::ops::Mul for &Value {
    type Output = Value;

    fn mul(self, rhs: Self) -> Value {
        crate::ops::mul(self, rhs)
    }
}

/// Evaluate a node from its inputs' current values.
///
/// Fails when an input is missing; callers that can regenerate activations
/// (checkpoint recomputation) restore them before calling this.
pub fn forward_eval_node(n: &Node) -> Result<Tensor> {
    let mut tensors = Vec::with_capacity(n.inputs().len());
    for p in n.inputs() {
        match p.value() {
            Some(t) => tensors.push(t),
            None => bail!(
                "input {} of {} has no value during forward evaluation",
                p.label(),
                n.label()
            ),
        }
    }
    eval_op(n.op(), &tensors)
}

fn expect_arity(op: Op, inputs: &[Tensor], arity: usize) -> Result<()> {
    if inputs.len() != arity {
        bail!("{} expects {} inputs, got {}", op, arity, inputs.len());
    }
    Ok(())
}

fn check_broadcast(op: Op, a: &Tensor, b: &Tensor) -> Result<()> {
    let ok = |x: usize, y: usize| x == y || x == 1 || y == 1;
    if !ok(a.rows(), b.rows()) || !ok(a.cols(), b.cols()) {
        bail!(
            "{}: shapes {:?} and {:?} do not broadcast",
            op,
            a.shape(),
            b.shape()
        );
    }
    Ok(())
}

fn check_same_shape(op: Op, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        bail!(
            "{}: shapes {:?} and {:?} must match",
            op,
            a.shape(),
            b.shape()
        );
    }
    Ok(())
}

/// Forward rule for each op tag.
pub fn eval_op(op: Op, inputs: &[Tensor]) -> Result<Tensor> {
    match op {
        Op::Leaf => bail!("leaf nodes are not evaluated; their value is assigned"),
        Op::Add => {
            expect_arity(op, inputs, 2)?;
            check_broadcast(op, &inputs[0], &inputs[1])?;
            Ok(&inputs[0] + &inputs[1])
        }
        Op::Sub => {
            expect_arity(op, inputs, 2)?;
            check_broadcast(op, &inputs[0], &inputs[1])?;
            Ok(&inputs[0] - &inputs[1])
        }
        Op::Mul => {
            expect_arity(op, inputs, 2)?;
            check_broadcast(op, &inputs[0], &inputs[1])?;
            Ok(&inputs[0] * &inputs[1])
        }
        Op::MatMul => {
            expect_arity(op, inputs, 2)?;
            if inputs[0].cols() != inputs[1].rows() {
                bail!(
                    "{}: inner dimensions disagree: {:?} @ {:?}",
                    op,
                    inputs[0].shape(),
                    inputs[1].shape()
                );
            }
            Ok(inputs[0].dot(&inputs[1]))
        }
        Op::Relu => {
            expect_arity(op, inputs, 1)?;
            Ok(inputs[0].map(|x| if x > 0.0 { x } else { 0.0 }))
        }
        Op::Gelu => {
            expect_arity(op, inputs, 1)?;
            Ok(inputs[0].map(gelu_scalar))
        }
        Op::Sum => {
            expect_arity(op, inputs, 1)?;
            Ok(Tensor::from_elem(1, 1, inputs[0].sum()))
        }
        Op::Mean => {
            expect_arity(op, inputs, 1)?;
            Ok(Tensor::from_elem(1, 1, inputs[0].mean()))
        }
        Op::MseLoss => {
            expect_arity(op, inputs, 2)?;
            check_same_shape(op, &inputs[0], &inputs[1])?;
            let diff = &inputs[0] - &inputs[1];
            Ok(Tensor::from_elem(1, 1, (&diff * &diff).mean()))
        }
        Op::CeWithLogits => {
            expect_arity(op, inputs, 2)?;
            check_same_shape(op, &inputs[0], &inputs[1])?;
            Ok(cross_entropy_forward(&inputs[0], &inputs[1]))
        }
    }
}

const GELU_C: f64 = 0.797_884_560_802_865_4; // sqrt(2 / pi)
const GELU_A: f64 = 0.044_715;

pub(crate) fn gelu_scalar(x: f64) -> f64 {
    let u = GELU_C * (x + GELU_A * x * x * x);
    0.5 * x * (1.0 + u.tanh())
}

pub(crate) fn gelu_prime_scalar(x: f64) -> f64 {
    let u = GELU_C * (x + GELU_A * x * x * x);
    let t = u.tanh();
    let du = GELU_C * (1.0 + 3.0 * GELU_A * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
}

/// Row-wise softmax with max-subtraction for stability.
pub(crate) fn softmax_rows(z: &Tensor) -> Tensor {
    let (rows, cols) = z.shape();
    let mut out = z.clone();
    for i in 0..rows {
        let mut max = f64::NEG_INFINITY;
        for j in 0..cols {
            max = max.max(z[(i, j)]);
        }
        let mut denom = 0.0;
        for j in 0..cols {
            denom += (z[(i, j)] - max).exp();
        }
        for j in 0..cols {
            out[(i, j)] = (z[(i, j)] - max).exp() / denom;
        }
    }
    out
}

/// Row-wise log-sum-exp, returned as an `R x 1` column.
pub(crate) fn logsumexp_rows(z: &Tensor) -> Tensor {
    let (rows, cols) = z.shape();
    Tensor::from_fn(rows, 1, |(i, _)| {
        let mut max = f64::NEG_INFINITY;
        for j in 0..cols {
            max = max.max(z[(i, j)]);
        }
        let mut denom = 0.0;
        for j in 0..cols {
            denom += (z[(i, j)] - max).exp();
        }
        max + denom.ln()
    })
}

fn cross_entropy_forward(logits: &Tensor, targets: &Tensor) -> Tensor {
    let (rows, cols) = logits.shape();
    let lse = logsumexp_rows(logits);
    let mut total = 0.0;
    for i in 0..rows {
        for j in 0..cols {
            total += targets[(i, j)] * (lse[(i, 0)] - logits[(i, j)]);
        }
    }
    Tensor::from_elem(1, 1, total / rows as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{constant, param};

    #[test]
    fn test_eager_evaluation() {
        let a = constant(Tensor::from_elem(2, 2, 3.0), "a");
        let b = constant(Tensor::from_elem(2, 2, 4.0), "b");
        let c = add(&a, &b);
        assert_eq!(c.value().unwrap()[(0, 0)], 7.0);
        assert!(!c.node().requires_grad());
    }

    #[test]
    fn test_requires_grad_propagates() {
        let a = constant(Tensor::ones(2, 2), "a");
        let w = param(Tensor::ones(2, 2), "w");
        let c = matmul(&a, &w);
        assert!(c.node().requires_grad());
    }

    #[test]
    fn test_bias_broadcast_add() {
        let x = constant(Tensor::ones(3, 2), "x");
        let b = constant(Tensor::from_vec(vec![10.0, 20.0], 1, 2).unwrap(), "b");
        let y = add(&x, &b);
        let v = y.value().unwrap();
        assert_eq!(v.shape(), (3, 2));
        assert_eq!(v[(2, 1)], 21.0);
    }

    #[test]
    fn test_operator_sugar() {
        let a = constant(Tensor::from_elem(2, 2, 5.0), "a");
        let b = constant(Tensor::from_elem(2, 2, 2.0), "b");
        assert_eq!((&a - &b).value().unwrap()[(0, 0)], 3.0);
        assert_eq!((&a * &b).value().unwrap()[(0, 0)], 10.0);
    }

    #[test]
    fn test_lazy_when_input_missing() {
        let a = constant(Tensor::ones(2, 2), "a");
        let r = relu(&a);
        r.node().clear_value();
        let s = sum(&r);
        // Input hole: node is created lazily with no value.
        assert!(s.value().is_none());

        r.node().set_value(Tensor::ones(2, 2));
        let v = forward_eval_node(s.node()).unwrap();
        assert_eq!(v.scalar().unwrap(), 4.0);
    }

    #[test]
    fn test_forward_eval_reports_missing_input() {
        let a = constant(Tensor::ones(2, 2), "a");
        let r = relu(&a);
        a.node().clear_value();
        let err = forward_eval_node(r.node()).unwrap_err();
        assert!(err.to_string().contains("has no value"));
    }

    #[test]
    fn test_relu_and_gelu_forward() {
        let x = constant(
            Tensor::from_vec(vec![-1.0, 0.0, 1.0, 2.0], 2, 2).unwrap(),
            "x",
        );
        let r = relu(&x).value().unwrap();
        assert_eq!(r[(0, 0)], 0.0);
        assert_eq!(r[(1, 1)], 2.0);

        let g = gelu(&x).value().unwrap();
        assert!(g[(0, 1)].abs() < 1e-12); // gelu(0) = 0
        assert!((g[(1, 0)] - 0.841_192).abs() < 1e-5);
    }

    #[test]
    fn test_reductions_and_losses() {
        let p = constant(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap(), "p");
        let t = constant(Tensor::from_vec(vec![1.0, 1.0, 1.0, 1.0], 2, 2).unwrap(), "t");

        assert_eq!(sum(&p).value().unwrap().scalar().unwrap(), 10.0);
        assert_eq!(mean(&p).value().unwrap().scalar().unwrap(), 2.5);

        // mse = mean([0, 1, 4, 9]) = 3.5
        let l = mse_loss(&p, &t).value().unwrap();
        assert!((l.scalar().unwrap() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        // Uniform logits over 4 classes with one-hot targets: loss = ln 4.
        let z = constant(Tensor::zeros(2, 4), "z");
        let t = constant(
            Tensor::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0], 2, 4).unwrap(),
            "t",
        );
        let l = cross_entropy_with_logits(&z, &t).value().unwrap();
        assert!((l.scalar().unwrap() - 4.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let z = Tensor::from_vec(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], 2, 3).unwrap();
        let s = softmax_rows(&z);
        for i in 0..2 {
            let row_sum: f64 = (0..3).map(|j| s[(i, j)]).sum();
            assert!((row_sum - 1.0).abs() < 1e-12);
        }
    }
}
