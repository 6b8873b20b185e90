// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// Total weight of the items in a nominal chunk. Items of weight 1 are grouped
/// by this many per chunk.
pub const TARGET_CHUNK_WEIGHT: f64 = 5000.0;

/// Maximal factor by which chunks grow beyond the nominal chunk size for large
/// inputs.
const MAX_CHUNK_MULTIPLIER: usize = 16;

/// Number of threads and chunk size chosen to process a workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadChunkSize {
    threads: usize,
    chunk_size: usize,
    size: usize,
}

impl ThreadChunkSize {
    /// Chooses the number of threads (at most `max_threads`) and the chunk size
    /// to process `size` items that each cost `per_item_weight`.
    ///
    /// Heavier items yield smaller chunks. Small workloads use fewer threads
    /// with evenly spread chunks, while large workloads use larger chunks (up
    /// to 16 times the nominal size) to reduce coordination overhead.
    pub fn new(max_threads: usize, size: usize, per_item_weight: f64) -> Self {
        let max_threads = max_threads.max(1);
        let weight = if per_item_weight.is_finite() && per_item_weight > 0.0 {
            per_item_weight
        } else {
            1.0
        };
        // The float-to-int conversion saturates, so this never overflows.
        let nominal = ((TARGET_CHUNK_WEIGHT / weight) as usize).max(1);

        if size == 0 {
            return Self {
                threads: 1,
                chunk_size: 1,
                size,
            };
        }

        match max_threads.checked_mul(nominal) {
            Some(capacity) if size > capacity => {
                let multiplier = (size / capacity).clamp(1, MAX_CHUNK_MULTIPLIER);
                Self {
                    threads: max_threads,
                    chunk_size: nominal * multiplier,
                    size,
                }
            }
            _ => {
                let threads = size.div_ceil(nominal).clamp(1, max_threads);
                Self {
                    threads,
                    chunk_size: size.div_ceil(threads),
                    size,
                }
            }
        }
    }

    /// Number of threads to use, including the calling thread.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of items per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks that the workload is split into.
    pub fn chunk_count(&self) -> usize {
        self.size.div_ceil(self.chunk_size)
    }
}
