// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use super::{chunks_in, claim_chunk, ChunkSource, IndexedSource, Segment};
#[cfg(feature = "log_parallelism")]
use crate::macros::log_trace;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A chunk source over an ordered sequence of sub-collections.
///
/// Chunks never straddle two sub-collections: the [`Segment::list()`] of each
/// borrowed segment identifies the sub-collection that the range indexes into.
pub struct CompositeChunkSource {
    /// Length of each sub-collection.
    lengths: Box<[usize]>,
    /// Fill cursor of each sub-collection.
    cursors: Box<[CachePadded<AtomicUsize>]>,
    /// Index of the sub-collection currently being handed out. This only ever
    /// increases.
    current: CachePadded<AtomicUsize>,
    /// Number of items handed out per chunk.
    chunk_size: usize,
    /// Sum of the lengths.
    total_len: usize,
}

// Here is a proof that `CompositeChunkSource` upholds the contract of
// `ChunkSource`.
//
// Each sub-collection is handed out exactly like a `ListChunkSource`: one
// `claim_chunk()` per attempt on its own cursor, with a segment
// returned if and only if the previous value is below the sub-collection's
// length. A thread that observes an exhausted cursor tries to advance
// `current` from the index it read to the next one with a compare-and-set; if
// another thread advanced it first, the compare-and-set fails and the thread
// simply retries with the new value. Since `current` only increases, an
// exhausted sub-collection is never revisited, and once `current` reaches the
// number of sub-collections every call returns `None`.
//
// A thread holding a stale `current` only reads the cursor of an exhausted
// sub-collection, apart from the one bump per thread that races with its
// exhaustion. Such bumps start at or beyond the length and never produce a
// segment, and `claim_chunk()` keeps them from wrapping the cursor around.
impl CompositeChunkSource {
    /// Creates a chunk source over sub-collections of the given lengths,
    /// handing out up to `chunk_size` items at a time. A chunk size of 0 is
    /// treated as 1, and chunk sizes larger than the longest sub-collection
    /// are capped to its length.
    pub fn new(lengths: impl IntoIterator<Item = usize>, chunk_size: usize) -> Self {
        let lengths: Box<[usize]> = lengths.into_iter().collect();
        let cursors = lengths
            .iter()
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        let total_len = lengths
            .iter()
            .fold(0usize, |total, &len| total.saturating_add(len));
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        Self {
            lengths,
            cursors,
            current: CachePadded::new(AtomicUsize::new(0)),
            chunk_size: chunk_size.clamp(1, max_len.max(1)),
            total_len,
        }
    }

    /// Creates a chunk source over the given sub-collections.
    pub fn over<S: IndexedSource>(collections: &[S], chunk_size: usize) -> Self {
        Self::new(collections.iter().map(S::source_len), chunk_size)
    }

    /// Number of sub-collections.
    pub fn num_lists(&self) -> usize {
        self.lengths.len()
    }

    /// Length of the given sub-collection.
    pub fn list_len(&self, list: usize) -> usize {
        self.lengths[list]
    }
}

impl ChunkSource for CompositeChunkSource {
    fn borrow<'s>(&self, segment: &'s mut Segment) -> Option<&'s Segment> {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let len = *self.lengths.get(current)?;
            if let Some(start) = claim_chunk(&self.cursors[current], len, self.chunk_size) {
                let end = len.min(start.saturating_add(self.chunk_size));
                #[cfg(feature = "log_parallelism")]
                log_trace!("Borrowed chunk {start}..{end} of list #{current}");
                segment.reset(current, start, end);
                return Some(segment);
            }
            current = match self.current.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => current + 1,
                Err(updated) => updated,
            };
        }
    }

    fn len(&self) -> usize {
        self.total_len
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn remaining_chunks(&self) -> usize {
        let current = self.current.load(Ordering::Acquire);
        self.lengths
            .iter()
            .zip(self.cursors.iter())
            .skip(current)
            .map(|(&len, cursor)| {
                let cursor = cursor.load(Ordering::Relaxed);
                chunks_in(len.saturating_sub(cursor), self.chunk_size)
            })
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{assert_tiles, collect_concurrently};
    use super::*;

    #[test]
    fn test_sequential_chunks_across_lists() {
        let source = CompositeChunkSource::new([3, 0, 5], 2);
        assert_eq!(source.len(), 8);
        assert_eq!(source.num_lists(), 3);
        assert_eq!(source.remaining_chunks(), 2 + 3);

        let mut segment = Segment::new();
        let mut borrowed = Vec::new();
        while let Some(s) = source.borrow(&mut segment) {
            borrowed.push((s.list(), s.range()));
        }
        assert_eq!(
            borrowed,
            [(0, 0..2), (0, 2..3), (2, 0..2), (2, 2..4), (2, 4..5)]
        );
        assert_eq!(source.borrow(&mut segment), None);
        assert_eq!(source.remaining_chunks(), 0);
    }

    #[test]
    fn test_no_lists() {
        let source = CompositeChunkSource::new(std::iter::empty(), 16);
        let mut segment = Segment::new();
        assert!(source.is_empty());
        assert_eq!(source.borrow(&mut segment), None);
    }

    #[test]
    fn test_only_empty_lists() {
        let source = CompositeChunkSource::new([0, 0, 0], 16);
        let mut segment = Segment::new();
        assert_eq!(source.remaining_chunks(), 0);
        assert_eq!(source.borrow(&mut segment), None);
        assert_eq!(source.borrow(&mut segment), None);
    }

    #[test]
    fn test_huge_lists_stay_exhausted() {
        let huge = usize::MAX / 2 + 2;
        let source = CompositeChunkSource::new([3, huge], huge);
        assert_eq!(source.len(), huge + 3);
        let mut segment = Segment::new();
        let mut borrowed = Vec::new();
        while let Some(s) = source.borrow(&mut segment) {
            borrowed.push((s.list(), s.range()));
        }
        assert_eq!(borrowed, [(0, 0..3), (1, 0..huge)]);
        for _ in 0..1000 {
            assert_eq!(source.borrow(&mut segment), None);
        }
        assert_eq!(source.remaining_chunks(), 0);
    }

    #[test]
    fn test_over_collections() {
        let lists = vec![vec![1u64; 100], vec![2; 1], vec![], vec![3; 257]];
        let source = CompositeChunkSource::over(&lists, 10);
        assert_eq!(source.list_len(3), 257);
        let segments = collect_concurrently(&source, 6);
        for (i, list) in lists.iter().enumerate() {
            assert_tiles(&segments, i, list.len(), 10);
        }
        let sum: u64 = segments
            .iter()
            .map(|s| lists[s.list()][s.range()].iter().sum::<u64>())
            .sum();
        assert_eq!(sum, 100 + 2 + 3 * 257);
    }
}
