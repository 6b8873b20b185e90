// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::mem::size_of;

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[10_000, 100_000, 1_000_000, 10_000_000];

fn sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum");
    for len in LENGTHS {
        group.throughput(Throughput::Bytes((len * size_of::<u64>()) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::sum);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::sum(bencher, num_threads, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("chunkpool@{num_threads}"), len),
                len,
                |bencher, len| chunkpool::sum(bencher, num_threads, len),
            );
        }
    }
    group.finish();
}

fn sum_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_composite");
    for len in LENGTHS {
        group.throughput(Throughput::Bytes((len * size_of::<u64>()) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::sum_composite);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::sum_composite(bencher, num_threads, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("chunkpool@{num_threads}"), len),
                len,
                |bencher, len| chunkpool::sum_composite(bencher, num_threads, len),
            );
        }
    }
    group.finish();
}

/// Splits `0..len` into 16 sub-collections of equal sizes.
fn make_lists(len: usize) -> Vec<Vec<u64>> {
    const NUM_LISTS: usize = 16;
    (0..NUM_LISTS)
        .map(|i| ((i * len / NUM_LISTS) as u64..((i + 1) * len / NUM_LISTS) as u64).collect())
        .collect()
}

/// Baseline benchmarks using serial iterators (without any multi-threading
/// involved).
mod serial {
    use criterion::{black_box, Bencher};

    pub fn sum(bencher: &mut Bencher, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        bencher.iter(|| black_box(input_slice).iter().sum::<u64>());
    }

    pub fn sum_composite(bencher: &mut Bencher, len: &usize) {
        let lists = super::make_lists(*len);
        bencher.iter(|| {
            black_box(&lists)
                .iter()
                .map(|list| list.iter().sum::<u64>())
                .sum::<u64>()
        });
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use criterion::{black_box, Bencher};
    use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

    pub fn sum(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let input_slice = input.as_slice();
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| bencher.iter(|| black_box(input_slice).par_iter().sum::<u64>()));
    }

    pub fn sum_composite(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let lists = super::make_lists(*len);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| {
            bencher.iter(|| {
                black_box(&lists)
                    .par_iter()
                    .flat_map(|list| list.par_iter())
                    .sum::<u64>()
            })
        });
    }
}

/// Benchmarks using Chunkpool.
mod chunkpool {
    use chunkpool::{CpuPinningPolicy, ThreadCount, WorkerPool, WorkerPoolBuilder};
    use criterion::{black_box, Bencher};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn make_pool(num_threads: usize) -> WorkerPool {
        // The calling thread also works, so the pool needs one thread less.
        WorkerPoolBuilder {
            max_threads: ThreadCount::try_from(num_threads.saturating_sub(1).max(1)).unwrap(),
            idle_timeout: Duration::from_secs(10),
            cpu_pinning: CpuPinningPolicy::IfSupported,
            thread_name: "bench-worker".to_owned(),
        }
        .build()
    }

    pub fn sum(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let input = Arc::new((0..*len as u64).collect::<Vec<u64>>());
        let pool = make_pool(num_threads);

        bencher.iter(|| {
            let total = Arc::new(AtomicU64::new(0));
            let input = black_box(&input).clone();
            pool.for_each_chunk_sized(input.len(), 1.0, {
                let total = total.clone();
                move |segment| {
                    let partial = input[segment.range()].iter().sum::<u64>();
                    total.fetch_add(partial, Ordering::Relaxed);
                    Ok(())
                }
            })
            .unwrap();
            total.load(Ordering::Relaxed)
        });
    }

    pub fn sum_composite(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let lists = Arc::new(super::make_lists(*len));
        let lengths = lists.iter().map(Vec::len).collect::<Vec<_>>();
        let pool = make_pool(num_threads);

        bencher.iter(|| {
            let total = Arc::new(AtomicU64::new(0));
            let lists = black_box(&lists).clone();
            pool.for_each_chunk_composite(lengths.iter().copied(), 1.0, {
                let total = total.clone();
                move |segment| {
                    let partial = lists[segment.list()][segment.range()]
                        .iter()
                        .sum::<u64>();
                    total.fetch_add(partial, Ordering::Relaxed);
                    Ok(())
                }
            })
            .unwrap();
            total.load(Ordering::Relaxed)
        });
    }
}

criterion_group!(benches, sum, sum_composite);
criterion_main!(benches);
