// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of parallel tasks.

use chunkpool::sizing::{SAMPLE_SIZE_1, SAMPLE_SIZE_2};
use chunkpool::{
    estimate_result_size, CpuPinningPolicy, PartitionFiller, ThreadCount, WorkerPool,
    WorkerPoolBuilder,
};
use clap::{Parser, ValueEnum};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn main() -> Result<(), chunkpool::Error> {
    env_logger::init();
    let cli = Cli::parse();

    let pool = WorkerPoolBuilder {
        max_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
        cpu_pinning: CpuPinningPolicy::IfSupported,
        thread_name: "cli-worker".to_owned(),
    }
    .build();

    match cli.scenario {
        Scenario::Sum => {
            let input = Arc::new((0..cli.input_size).collect::<Vec<u64>>());
            let sum = sum(&pool, black_box(input), cli.weight)?;
            println!("sum = {sum}");
        }
        Scenario::SumComposite => {
            // Split the input into sub-collections of decreasing sizes.
            let mut inputs = Vec::new();
            let mut start = 0;
            while start < cli.input_size {
                let end = (start + (cli.input_size - start).div_ceil(2)).min(cli.input_size);
                inputs.push((start..end).collect::<Vec<u64>>());
                start = end;
            }
            let inputs = Arc::new(black_box(inputs));
            let total = Arc::new(AtomicU64::new(0));
            pool.for_each_chunk_composite(inputs.iter().map(Vec::len), cli.weight, {
                let inputs = inputs.clone();
                let total = total.clone();
                move |segment| {
                    let partial = inputs[segment.list()][segment.range()]
                        .iter()
                        .sum::<u64>();
                    total.fetch_add(partial, Ordering::Relaxed);
                    Ok(())
                }
            })?;
            println!(
                "sum = {} over {} sub-collections",
                total.load(Ordering::Relaxed),
                inputs.len()
            );
        }
        Scenario::Filter => {
            let input = Arc::new(fill_needles(cli.input_size as usize, cli.density));
            let found = filter(&pool, black_box(input), cli.weight)?;
            println!("found {} needles", found.len());
        }
        Scenario::Fail => {
            let result = pool.for_each_chunk_sized(cli.input_size as usize, cli.weight, |segment| {
                if segment.range().contains(&0) {
                    return Err("refusing to process item 0".into());
                }
                Ok(())
            });
            match result {
                Ok(()) => println!("no failure"),
                Err(e) => println!("failed: {e} ({:?})", e.cause()),
            }
        }
    }

    pool.shutdown();
    Ok(())
}

/// Sums the input in parallel.
fn sum(pool: &WorkerPool, input: Arc<Vec<u64>>, weight: f64) -> Result<u64, chunkpool::Error> {
    let total = Arc::new(AtomicU64::new(0));
    pool.for_each_chunk_sized(input.len(), weight, {
        let total = total.clone();
        move |segment| {
            let partial = input[segment.range()].iter().sum::<u64>();
            total.fetch_add(partial, Ordering::Relaxed);
            Ok(())
        }
    })?;
    Ok(total.load(Ordering::Relaxed))
}

/// Collects the indices of the needles in parallel, into an output buffer
/// sized from the selectivity observed on two small prefixes of the input.
fn filter(
    pool: &WorkerPool,
    input: Arc<Vec<bool>>,
    weight: f64,
) -> Result<Vec<usize>, chunkpool::Error> {
    let count_prefix = |len: usize| input[..len.min(input.len())].iter().filter(|x| **x).count();
    let estimate = estimate_result_size(
        count_prefix(SAMPLE_SIZE_1),
        count_prefix(SAMPLE_SIZE_2),
        input.len(),
    );
    println!("estimated output size = {estimate}");

    // Matches that don't fit in the estimated output are collected separately.
    let overflow = Arc::new(Mutex::new(Vec::new()));
    let filler = Arc::new(PartitionFiller::new(estimate, pool.max_threads() + 1));
    let output = Arc::new(
        (0..estimate)
            .map(|_| AtomicUsize::new(usize::MAX))
            .collect::<Vec<_>>(),
    );

    pool.for_each_chunk_sized(input.len(), weight, {
        let input = input.clone();
        let filler = filler.clone();
        let output = output.clone();
        let overflow = overflow.clone();
        move |segment| {
            let mut count = filler.count();
            for i in segment.range().filter(|&i| input[i]) {
                match count.next_index() {
                    Some(index) => output[index].store(i, Ordering::Relaxed),
                    None => overflow.lock().unwrap().push(i),
                }
            }
            Ok(())
        }
    })?;

    let mut found = filler
        .filled_ranges()
        .into_iter()
        .flatten()
        .map(|index| output[index].load(Ordering::Relaxed))
        .collect::<Vec<_>>();
    let overflow = std::mem::take(&mut *overflow.lock().unwrap());
    println!(
        "filled {} of {} estimated slots, {} overflowed",
        filler.total_filled(),
        estimate,
        overflow.len()
    );
    found.extend(overflow);
    found.sort_unstable();
    Ok(found)
}

/// Creates a vector of `input_size` booleans, `density` of which are set to
/// [`true`] (the needles). The set of needles follows a uniform distribution,
/// but is fixed by a constant-time seed for reproducibility.
fn fill_needles(input_size: usize, density: usize) -> Vec<bool> {
    let mut input = vec![false; input_size];

    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let needles = index::sample(&mut rng, input_size, density.min(input_size));
    for needle in needles {
        input[needle] = true;
    }

    input
}

/// CLI tool to run examples of parallel tasks.
#[derive(Parser, Debug, PartialEq)]
#[command(version)]
struct Cli {
    /// Maximal number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Milliseconds after which an idle worker thread exits.
    #[arg(long, default_value_t = 1000)]
    idle_timeout_ms: u64,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Relative cost of processing one item, used to size the chunks.
    #[arg(long, default_value_t = 1.0)]
    weight: f64,

    /// Number of items that match the filter. Used only for the filter
    /// scenario.
    #[arg(long, default_value_t = 1000)]
    density: usize,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a slice of numbers.
    Sum,
    /// Sum numbers spread over several sub-collections.
    SumComposite,
    /// Collect the indices of the matching items.
    Filter,
    /// Fail on one chunk, and report the failure.
    Fail,
}
