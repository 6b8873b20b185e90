// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Splits an output of a known total size into contiguous partitions of
/// near-equal sizes, that several unsynchronized producers fill concurrently.
///
/// Each producer obtains a [`Count`] handle via [`count()`](Self::count), which
/// hands out output indices one at a time. A handle fills one partition at a
/// time and moves on to another partition once it is full, so that producers
/// mostly write to disjoint regions of the output buffer.
pub struct PartitionFiller {
    /// Boundaries of the partitions: partition `i` spans
    /// `bounds[i]..bounds[i + 1]`.
    bounds: Box<[usize]>,
    /// Number of indices handed out in each partition.
    filled: Box<[CachePadded<AtomicUsize>]>,
    /// Next partition to hand to a producer.
    next_partition: CachePadded<AtomicUsize>,
}

impl PartitionFiller {
    /// Creates a filler for an output of `total` items split into `partitions`
    /// partitions. A partition count of 0 is treated as 1.
    pub fn new(total: usize, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let bounds = (0..=partitions)
            .map(|i| {
                // Computed in 128 bits to avoid overflowing `i * total`.
                ((i as u128 * total as u128) / partitions as u128) as usize
            })
            .collect();
        let filled = (0..partitions)
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        Self {
            bounds,
            filled,
            next_partition: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Total number of items that can be filled.
    pub fn total(&self) -> usize {
        self.bounds[self.bounds.len() - 1]
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.filled.len()
    }

    /// Range of output indices covered by the given partition.
    pub fn partition_range(&self, partition: usize) -> std::ops::Range<usize> {
        self.bounds[partition]..self.bounds[partition + 1]
    }

    /// Number of indices handed out in the given partition so far.
    pub fn filled(&self, partition: usize) -> usize {
        self.filled[partition].load(Ordering::Acquire)
    }

    /// Number of indices handed out in all partitions so far.
    pub fn total_filled(&self) -> usize {
        (0..self.num_partitions()).map(|p| self.filled(p)).sum()
    }

    /// The occupied prefix of each partition, in order. These are the regions
    /// of the output buffer that have been handed out, and that a caller needs
    /// to compact if the output isn't completely filled.
    pub fn filled_ranges(&self) -> Vec<std::ops::Range<usize>> {
        (0..self.num_partitions())
            .map(|p| {
                let start = self.bounds[p];
                start..start + self.filled(p)
            })
            .collect()
    }

    /// Returns a new handle to fill this output.
    pub fn count(&self) -> Count<'_> {
        Count {
            filler: self,
            partition: None,
            scan_from: 0,
            filled: 0,
        }
    }

    /// Attempts to reserve one more index in the given partition.
    fn try_fill(&self, partition: usize) -> Option<usize> {
        let capacity = self.bounds[partition + 1] - self.bounds[partition];
        let counter = &self.filled[partition];
        let backoff = Backoff::new();
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                return None;
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.bounds[partition] + current),
                Err(updated) => {
                    current = updated;
                    backoff.spin();
                }
            }
        }
    }

    /// Claims a partition that may still have room. Fresh partitions are handed
    /// out first; once all of them have been claimed, partitions are scanned
    /// for leftover capacity starting at `scan_from`.
    fn claim_partition(&self, scan_from: &mut usize) -> Option<usize> {
        let num_partitions = self.num_partitions();
        if self.next_partition.load(Ordering::Relaxed) < num_partitions {
            let partition = self.next_partition.fetch_add(1, Ordering::Relaxed);
            if partition < num_partitions {
                return Some(partition);
            }
        }
        while *scan_from < num_partitions {
            let partition = *scan_from;
            *scan_from += 1;
            if self.filled(partition) < self.partition_range(partition).len() {
                return Some(partition);
            }
        }
        None
    }
}

/// A producer's handle on a [`PartitionFiller`].
pub struct Count<'a> {
    filler: &'a PartitionFiller,
    /// Partition currently being filled.
    partition: Option<usize>,
    /// Next partition to inspect once all partitions have been claimed.
    scan_from: usize,
    /// Number of indices handed out to this handle.
    filled: usize,
}

impl Count<'_> {
    /// Reserves the next output index for this producer, or returns [`None`]
    /// if the output is full.
    pub fn next_index(&mut self) -> Option<usize> {
        loop {
            let partition = match self.partition {
                Some(partition) => partition,
                None => {
                    let partition = self.filler.claim_partition(&mut self.scan_from)?;
                    self.partition = Some(partition);
                    partition
                }
            };
            if let Some(index) = self.filler.try_fill(partition) {
                self.filled += 1;
                return Some(index);
            }
            self.partition = None;
        }
    }

    /// Number of indices handed out to this handle so far.
    pub fn filled(&self) -> usize {
        self.filled
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::sync::Barrier;

    /// Runs one producer per entry of `requests`, each asking for that many
    /// indices, and returns the indices handed to each producer.
    fn fill_concurrently(filler: &PartitionFiller, requests: &[usize]) -> Vec<Vec<usize>> {
        let barrier = Barrier::new(requests.len());
        std::thread::scope(|scope| {
            let handles = requests
                .iter()
                .map(|&request| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let mut count = filler.count();
                        barrier.wait();
                        let indices = (0..request)
                            .map_while(|_| count.next_index())
                            .collect::<Vec<_>>();
                        assert_eq!(count.filled(), indices.len());
                        indices
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn check_balance(filler: &PartitionFiller, requests: &[usize]) {
        let per_producer = fill_concurrently(filler, requests);
        let requested: usize = requests.iter().sum();
        let total = filler.total();

        let mut all = per_producer.concat();
        assert_eq!(all.len(), requested.min(total));
        assert_eq!(filler.total_filled(), requested.min(total));
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), requested.min(total), "an index was handed twice");
        assert!(all.iter().all(|&i| i < total));

        for p in 0..filler.num_partitions() {
            assert!(filler.filled(p) <= filler.partition_range(p).len());
        }
        let mut from_ranges = filler.filled_ranges().into_iter().flatten().collect::<Vec<_>>();
        from_ranges.sort_unstable();
        assert_eq!(from_ranges, all);
    }

    #[test]
    fn test_partition_bounds() {
        let filler = PartitionFiller::new(10, 3);
        assert_eq!(filler.total(), 10);
        assert_eq!(filler.partition_range(0), 0..3);
        assert_eq!(filler.partition_range(1), 3..6);
        assert_eq!(filler.partition_range(2), 6..10);

        let filler = PartitionFiller::new(usize::MAX, 7);
        assert_eq!(filler.total(), usize::MAX);
        assert_eq!(filler.partition_range(6).end, usize::MAX);
    }

    #[test]
    fn test_single_producer_fills_in_order() {
        let filler = PartitionFiller::new(7, 2);
        let mut count = filler.count();
        let indices = std::iter::from_fn(|| count.next_index()).collect::<Vec<_>>();
        assert_eq!(indices, [0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(filler.count().next_index(), None);
    }

    #[test]
    fn test_leftover_capacity_is_reused() {
        let filler = PartitionFiller::new(8, 4);
        // The first producer claims partition 0 and stops after one index.
        let mut first = filler.count();
        assert_eq!(first.next_index(), Some(0));
        // The second producer claims the 3 other partitions, then scans for
        // leftover capacity in partition 0.
        let mut second = filler.count();
        let indices = std::iter::from_fn(|| second.next_index()).collect::<Vec<_>>();
        assert_eq!(indices, [2, 3, 4, 5, 6, 7, 1]);
        assert_eq!(first.next_index(), None);
        assert_eq!(filler.total_filled(), 8);
    }

    #[test]
    fn test_empty_output() {
        let filler = PartitionFiller::new(0, 4);
        assert_eq!(filler.count().next_index(), None);
        let filler = PartitionFiller::new(5, 0);
        assert_eq!(filler.num_partitions(), 1);
        check_balance(&filler, &[3, 3]);
    }

    #[test]
    fn test_random_balance() {
        let mut rng = ChaCha8Rng::seed_from_u64(1234);
        for _ in 0..40 {
            let total = rng.random_range(0..3_000);
            let partitions = rng.random_range(1..16);
            let requests = (0..rng.random_range(1..8))
                .map(|_| rng.random_range(0..1_000))
                .collect::<Vec<usize>>();
            let filler = PartitionFiller::new(total, partitions);
            check_balance(&filler, &requests);
        }
    }
}
