// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmarks the byte-buffer pool's hot path: single-threaded `alloc` at a
//! range of sizes, and the cost of releasing an outstanding slice.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use reactor_net::BufferPool;
use std::hint::black_box as bb;

const CHUNK_SIZE: usize = 64 * 1024;

fn slabpool_reserve_256b(c: &mut Criterion) {
    let pool = BufferPool::new(CHUNK_SIZE, 8, 32);
    c.bench_function("slabpool_reserve_256b", |b| {
        b.iter(|| bb(pool.alloc_exact(256)));
    });
}

fn slabpool_reserve_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("slabpool_reserve_by_size");
    for size in [16usize, 256, 4096, CHUNK_SIZE, CHUNK_SIZE * 4] {
        let pool = BufferPool::new(CHUNK_SIZE, 8, 32);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| bb(pool.alloc_exact(size)));
        });
    }
    group.finish();
}

fn slabpool_release(c: &mut Criterion) {
    let pool = BufferPool::new(CHUNK_SIZE, 8, 32);
    c.bench_function("slabpool_release", |b| {
        b.iter_batched(
            || pool.alloc_exact(256),
            |buf| drop(bb(buf)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    slabpool_reserve_256b,
    slabpool_reserve_by_size,
    slabpool_release
);
criterion_main!(benches);
