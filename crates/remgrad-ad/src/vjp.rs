//! Vector-Jacobian product rules, dispatched by op tag.
//!
//! For a node `y = f(x1, x2, ...)` and an upstream gradient `gy = dL/dy`,
//! the rule for `f` computes each parent's contribution and accumulates it
//! elementwise into the parent's gradient. Accumulation is additive and
//! commutative, so the visiting order of a parent's children is irrelevant.
//!
//! `vjp_lookup` returns `None` for ops with no registered rule; the backward
//! engine warns and skips those rather than failing.

use crate::graph::{Node, Op, Tensor};
use crate::ops::{gelu_prime_scalar, logsumexp_rows, softmax_rows};
use anyhow::{bail, Result};

/// A reverse-mode rule: reads `(node, gy)`, accumulates into parents.
pub type VjpFn = fn(&Node, &Tensor) -> Result<()>;

/// Look up the VJP rule for an op tag.
pub fn vjp_lookup(op: Op) -> Option<VjpFn> {
    match op {
        Op::Leaf => None,
        Op::Add => Some(vjp_add),
        Op::Sub => Some(vjp_sub),
        Op::Mul => Some(vjp_mul),
        Op::MatMul => Some(vjp_matmul),
        Op::Relu => Some(vjp_relu),
        Op::Gelu => Some(vjp_gelu),
        Op::Sum => Some(vjp_sum),
        Op::Mean => Some(vjp_mean),
        Op::MseLoss => Some(vjp_mse_loss),
        Op::CeWithLogits => Some(vjp_ce_with_logits),
    }
}

/// Current value of input `i`, which backward guarantees is materialized.
fn input_value(n: &Node, i: usize) -> Result<Tensor> {
    match n.inputs()[i].value() {
        Some(t) => Ok(t),
        None => bail!(
            "input {} of {} has no value during VJP",
            n.inputs()[i].label(),
            n.label()
        ),
    }
}

/// Fold a gradient back onto a broadcast parent shape.
///
/// A `1 x C` bias or `1 x 1` scalar that was broadcast in the forward pass
/// receives the sum of the gradient over the broadcast axes.
pub(crate) fn reduce_like(g: &Tensor, shape: (usize, usize)) -> Tensor {
    let mut out = g.clone();
    if shape.0 == 1 && out.rows() > 1 {
        out = out.sum_rows();
    }
    if shape.1 == 1 && out.cols() > 1 {
        out = out.sum_cols();
    }
    out
}

fn vjp_add(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let b = input_value(n, 1)?;
    n.inputs()[0].accumulate_grad(&reduce_like(gy, a.shape()));
    n.inputs()[1].accumulate_grad(&reduce_like(gy, b.shape()));
    Ok(())
}

fn vjp_sub(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let b = input_value(n, 1)?;
    n.inputs()[0].accumulate_grad(&reduce_like(gy, a.shape()));
    n.inputs()[1].accumulate_grad(&reduce_like(&-gy, b.shape()));
    Ok(())
}

fn vjp_mul(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let b = input_value(n, 1)?;
    n.inputs()[0].accumulate_grad(&reduce_like(&(gy * &b), a.shape()));
    n.inputs()[1].accumulate_grad(&reduce_like(&(gy * &a), b.shape()));
    Ok(())
}

fn vjp_matmul(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let b = input_value(n, 1)?;
    n.inputs()[0].accumulate_grad(&gy.dot(&b.t()));
    n.inputs()[1].accumulate_grad(&a.t().dot(gy));
    Ok(())
}

fn vjp_relu(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let mask = a.map(|x| if x > 0.0 { 1.0 } else { 0.0 });
    n.inputs()[0].accumulate_grad(&(gy * &mask));
    Ok(())
}

fn vjp_gelu(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let dgelu = a.map(gelu_prime_scalar);
    n.inputs()[0].accumulate_grad(&(gy * &dgelu));
    Ok(())
}

fn vjp_sum(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let g = gy.scalar()?;
    let (r, c) = a.shape();
    n.inputs()[0].accumulate_grad(&Tensor::from_elem(r, c, g));
    Ok(())
}

fn vjp_mean(n: &Node, gy: &Tensor) -> Result<()> {
    let a = input_value(n, 0)?;
    let g = gy.scalar()?;
    let (r, c) = a.shape();
    n.inputs()[0].accumulate_grad(&Tensor::from_elem(r, c, g / a.numel() as f64));
    Ok(())
}

fn vjp_mse_loss(n: &Node, gy: &Tensor) -> Result<()> {
    let p = input_value(n, 0)?;
    let t = input_value(n, 1)?;
    let g = gy.scalar()?;
    let diff = &p - &t;
    let gp = diff.scale(2.0 * g / p.numel() as f64);
    n.inputs()[0].accumulate_grad(&gp);
    n.inputs()[1].accumulate_grad(&-&gp);
    Ok(())
}

fn vjp_ce_with_logits(n: &Node, gy: &Tensor) -> Result<()> {
    let z = input_value(n, 0)?;
    let t = input_value(n, 1)?;
    let g = gy.scalar()?;
    let batch = z.rows() as f64;

    let s = softmax_rows(&z);
    // dL/dz = ((sum_k t_k) * softmax - t) / B, per row
    let t_row_sums = t.sum_cols();
    let gz = (&(&s * &t_row_sums) - &t).scale(g / batch);
    n.inputs()[0].accumulate_grad(&gz);

    // dL/dt = (lse - z) / B, per element
    let lse = logsumexp_rows(&z);
    let gt = (&lse - &z).scale(g / batch);
    n.inputs()[1].accumulate_grad(&gt);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{constant, param};
    use crate::ops;

    #[test]
    fn test_lookup_covers_all_non_leaf_ops() {
        for op in [
            Op::Add,
            Op::Sub,
            Op::Mul,
            Op::MatMul,
            Op::Relu,
            Op::Gelu,
            Op::Sum,
            Op::Mean,
            Op::MseLoss,
            Op::CeWithLogits,
        ] {
            assert!(vjp_lookup(op).is_some(), "no VJP for {}", op);
        }
        assert!(vjp_lookup(Op::Leaf).is_none());
    }

    #[test]
    fn test_reduce_like_row_and_scalar() {
        let g = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let row = reduce_like(&g, (1, 2));
        assert_eq!(row.shape(), (1, 2));
        assert_eq!(row[(0, 0)], 4.0);
        assert_eq!(row[(0, 1)], 6.0);

        let scalar = reduce_like(&g, (1, 1));
        assert_eq!(scalar.shape(), (1, 1));
        assert_eq!(scalar[(0, 0)], 10.0);

        let same = reduce_like(&g, (2, 2));
        assert!(same.allclose(&g, 0.0));
    }

    #[test]
    fn test_bias_gradient_sums_over_rows() {
        let x = constant(Tensor::ones(3, 2), "x");
        let b = param(Tensor::zeros(1, 2), "b");
        let y = ops::add(&x, &b);

        let rule = vjp_lookup(Op::Add).unwrap();
        rule(y.node(), &Tensor::ones(3, 2)).unwrap();

        let gb = b.grad().unwrap();
        assert_eq!(gb.shape(), (1, 2));
        assert_eq!(gb[(0, 0)], 3.0);
    }

    #[test]
    fn test_matmul_gradients() {
        let a = param(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap(), "a");
        let b = param(Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], 2, 2).unwrap(), "b");
        let c = ops::matmul(&a, &b);

        let rule = vjp_lookup(Op::MatMul).unwrap();
        rule(c.node(), &Tensor::ones(2, 2)).unwrap();

        // dA = ones @ B^T, dB = A^T @ ones
        let ga = a.grad().unwrap();
        let gb = b.grad().unwrap();
        assert_eq!(ga[(0, 0)], 11.0);
        assert_eq!(ga[(0, 1)], 15.0);
        assert_eq!(gb[(0, 0)], 4.0);
        assert_eq!(gb[(1, 0)], 6.0);
    }

    #[test]
    fn test_ce_gradient_rows_sum_to_zero() {
        // With one-hot targets, each row of dL/dz sums to zero.
        let z = param(Tensor::from_vec(vec![1.0, 2.0, 0.5, -1.0, 0.0, 2.0], 2, 3).unwrap(), "z");
        let t = constant(
            Tensor::from_vec(vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0], 2, 3).unwrap(),
            "t",
        );
        let loss = ops::cross_entropy_with_logits(&z, &t);

        let rule = vjp_lookup(Op::CeWithLogits).unwrap();
        rule(loss.node(), &Tensor::ones(1, 1)).unwrap();

        let gz = z.grad().unwrap();
        for i in 0..2 {
            let row_sum: f64 = (0..3).map(|j| gz[(i, j)]).sum();
            assert!(row_sum.abs() < 1e-12);
        }
    }
}
