//! Jacobian-vector product rules, dispatched by op tag.
//!
//! For a node `y = f(x1, x2, ...)` with parent tangents `dx1, dx2, ...`,
//! the rule returns the output tangent `dy`. Rules receive the parents'
//! tangents in input order; unseeded parents arrive as zeros shaped like
//! their values.

use crate::graph::{Node, Op, Tensor};
use crate::ops::{gelu_prime_scalar, logsumexp_rows, softmax_rows};
use anyhow::{bail, Result};

/// A forward-mode rule: reads `(node, parent tangents)`, returns the node's
/// tangent.
pub type JvpFn = fn(&Node, &[Tensor]) -> Result<Tensor>;

/// Look up the JVP rule for an op tag.
pub fn jvp_lookup(op: Op) -> Option<JvpFn> {
    match op {
        Op::Leaf => None,
        Op::Add => Some(jvp_add),
        Op::Sub => Some(jvp_sub),
        Op::Mul => Some(jvp_mul),
        Op::MatMul => Some(jvp_matmul),
        Op::Relu => Some(jvp_relu),
        Op::Gelu => Some(jvp_gelu),
        Op::Sum => Some(jvp_sum),
        Op::Mean => Some(jvp_mean),
        Op::MseLoss => Some(jvp_mse_loss),
        Op::CeWithLogits => Some(jvp_ce_with_logits),
    }
}

fn input_value(n: &Node, i: usize) -> Result<Tensor> {
    match n.inputs()[i].value() {
        Some(t) => Ok(t),
        None => bail!(
            "input {} of {} has no value during JVP",
            n.inputs()[i].label(),
            n.label()
        ),
    }
}

fn jvp_add(_n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    Ok(&tangents[0] + &tangents[1])
}

fn jvp_sub(_n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    Ok(&tangents[0] - &tangents[1])
}

fn jvp_mul(n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    let a = input_value(n, 0)?;
    let b = input_value(n, 1)?;
    Ok(&(&tangents[0] * &b) + &(&a * &tangents[1]))
}

fn jvp_matmul(n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    let a = input_value(n, 0)?;
    let b = input_value(n, 1)?;
    Ok(&tangents[0].dot(&b) + &a.dot(&tangents[1]))
}

fn jvp_relu(n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    let a = input_value(n, 0)?;
    let mask = a.map(|x| if x > 0.0 { 1.0 } else { 0.0 });
    Ok(&mask * &tangents[0])
}

fn jvp_gelu(n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    let a = input_value(n, 0)?;
    Ok(&a.map(gelu_prime_scalar) * &tangents[0])
}

fn jvp_sum(_n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    Ok(Tensor::from_elem(1, 1, tangents[0].sum()))
}

fn jvp_mean(_n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    Ok(Tensor::from_elem(1, 1, tangents[0].mean()))
}

fn jvp_mse_loss(n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    let p = input_value(n, 0)?;
    let t = input_value(n, 1)?;
    let diff = &p - &t;
    let dt = &tangents[0] - &tangents[1];
    let d = 2.0 * (&diff * &dt).sum() / p.numel() as f64;
    Ok(Tensor::from_elem(1, 1, d))
}

fn jvp_ce_with_logits(n: &Node, tangents: &[Tensor]) -> Result<Tensor> {
    let z = input_value(n, 0)?;
    let t = input_value(n, 1)?;
    let tz = &tangents[0];
    let tt = &tangents[1];
    let batch = z.rows() as f64;

    let s = softmax_rows(&z);
    let lse = logsumexp_rows(&z);

    // d(lse_i) = sum_k softmax_ik dz_ik, per row
    let dlse = (&s * tz).sum_cols();
    let term_targets = (&(&lse - &z) * tt).sum();
    let term_logits = (&(&dlse - tz) * &t).sum();
    Ok(Tensor::from_elem(1, 1, (term_targets + term_logits) / batch))
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
            assert!(jvp_lookup(op).is_some(), "no JVP for {}", op);
        }
        assert!(jvp_lookup(Op::Leaf).is_none());
    }

    #[test]
    fn test_mul_product_rule() {
        let a = param(Tensor::from_elem(2, 2, 3.0), "a");
        let b = param(Tensor::from_elem(2, 2, 5.0), "b");
        let c = ops::mul(&a, &b);

        let rule = jvp_lookup(Op::Mul).unwrap();
        // da = 1, db = 0: dy = b
        let dy = rule(c.node(), &[Tensor::ones(2, 2), Tensor::zeros(2, 2)]).unwrap();
        assert_eq!(dy[(0, 0)], 5.0);
        // da = 0, db = 1: dy = a
        let dy = rule(c.node(), &[Tensor::zeros(2, 2), Tensor::ones(2, 2)]).unwrap();
        assert_eq!(dy[(1, 1)], 3.0);
    }

    #[test]
    fn test_sum_tangent_is_total() {
        let x = constant(Tensor::ones(2, 3), "x");
        let s = ops::sum(&x);
        let rule = jvp_lookup(Op::Sum).unwrap();
        let dy = rule(s.node(), &[Tensor::from_elem(2, 3, 0.5)]).unwrap();
        assert_eq!(dy.scalar().unwrap(), 3.0);
    }

    #[test]
    fn test_mse_tangent_matches_finite_difference() {
        let p = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let t = Tensor::from_vec(vec![0.5, 1.5, 2.5, 5.0], 2, 2).unwrap();
        let dir = Tensor::from_vec(vec![1.0, -1.0, 0.5, 2.0], 2, 2).unwrap();

        let pred = param(p.clone(), "p");
        let target = constant(t.clone(), "t");
        let loss = ops::mse_loss(&pred, &target);

        let rule = jvp_lookup(Op::MseLoss).unwrap();
        let dy = rule(loss.node(), &[dir.clone(), Tensor::zeros(2, 2)]).unwrap();

        let eps = 1e-6;
        let loss_at = |shift: f64| {
            let shifted = &p + &dir.scale(shift);
            let diff = &shifted - &t;
            (&diff * &diff).mean()
        };
        let fd = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
        assert!((dy.scalar().unwrap() - fd).abs() < 1e-6);
    }
}
