//! Benchmarks for the chunk-dispatch worker pool.
//!
//! Run:
//! - cargo bench
//! - cargo bench -- pool_dispatch

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use lockstep::{RangeFn, WorkerPool};

const ELEMENT_LENS: [usize; 3] = [1_000, 10_000, 100_000];
const CHUNK_LENS: [usize; 3] = [64, 256, 1024];

fn integration_task(state: Arc<Vec<AtomicU64>>) -> RangeFn {
    Arc::new(move |begin, end, _frame, dt| {
        for slot in &state[begin..end] {
            let v = f64::from_bits(slot.load(Ordering::Relaxed)) + 0.001 * dt;
            slot.store(v.to_bits(), Ordering::Relaxed);
        }
    })
}

fn make_state(n: usize) -> Arc<Vec<AtomicU64>> {
    Arc::new((0..n).map(|_| AtomicU64::new(10.0f64.to_bits())).collect())
}

fn bench_pool_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_dispatch");
    group.sample_size(50);

    for workers in [2, 4, 8] {
        let pool = WorkerPool::new(workers, true);
        for &n in &ELEMENT_LENS {
            let task = integration_task(make_state(n));
            for &chunk in &CHUNK_LENS {
                let id = BenchmarkId::new("case", format!("w{workers}_n{n}_c{chunk}"));
                group.bench_function(id, |b| {
                    b.iter(|| {
                        pool.parallel_for(black_box(n), chunk, 0, 0.001, &task);
                    });
                });
            }
        }
    }

    group.finish();
}

fn bench_inline_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_baseline");
    group.sample_size(50);

    for &n in &ELEMENT_LENS {
        let task = integration_task(make_state(n));
        let id = BenchmarkId::new("case", format!("n{n}"));
        group.bench_function(id, |b| {
            b.iter(|| {
                (*task)(0, black_box(n), 0, 0.001);
            });
        });
    }

    group.finish();
}

criterion_group!(parallel_dispatch, bench_pool_dispatch, bench_inline_baseline);
criterion_main!(parallel_dispatch);
