use std::hint::black_box;

use benchmark::sync_wait::*;
use criterion::{criterion_group, criterion_main, Criterion};

pub fn bench_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_wait/completion");
    group.bench_function("synchronous", |b| b.iter(|| synchronous(black_box(100))));
    group.bench_function("asynchronous", |b| b.iter(|| asynchronous(black_box(100))));
    group.finish();
}

criterion_group!(benches, bench_completion);
criterion_main!(benches);
