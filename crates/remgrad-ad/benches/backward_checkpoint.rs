//! Backward-pass cost with and without eviction/recomputation.

use criterion::{criterion_group, criterion_main, Criterion};
use remgrad_ad::prelude::*;

fn build_stack(depth: usize) -> Value {
    let x = constant(Tensor::randn(16, 32, 1), "x");
    let mut cur = x;
    for i in 0..depth {
        let w = param(Tensor::randn(32, 32, 10 + i as u64), &format!("W{}", i));
        cur = relu(&matmul(&cur, &w));
    }
    sum(&cur)
}

fn bench_backward(c: &mut Criterion) {
    let loss = build_stack(12);
    c.bench_function("backward_plain", |b| {
        b.iter(|| {
            zero_grad(&loss);
            backward(&loss, None).unwrap();
        })
    });

    let loss = build_stack(12);
    auto_checkpoint_every_n(&loss, 1);
    capture_checkpoint_snapshots(&loss);
    c.bench_function("backward_with_eviction", |b| {
        b.iter(|| {
            zero_grad(&loss);
            evict_non_checkpoint_values(&loss);
            backward(&loss, None).unwrap();
        })
    });
}

criterion_group!(benches, bench_backward);
criterion_main!(benches);
