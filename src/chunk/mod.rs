// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lock-free partitioning of indexed collections into chunks of work.
//!
//! A [`ChunkSource`] hands out non-overlapping [`Segment`]s of a collection to
//! any number of concurrent callers. Each chunk is claimed with one atomic
//! update of a shared cursor, and the union of all segments handed out until
//! exhaustion is exactly the full index range of the collection.

mod composite;
mod list;
mod source;

pub use composite::CompositeChunkSource;
pub use list::ListChunkSource;
pub use source::IndexedSource;

use std::sync::atomic::{AtomicUsize, Ordering};

/// A half-open range `[start, end)` of indices into a collection.
///
/// Segments are meant to be recycled: a worker owns one segment and passes it
/// by exclusive reference to [`ChunkSource::borrow()`], which resets it in
/// place rather than allocating a new one per chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Index of the sub-collection, always 0 for single collections.
    list: usize,
    /// First index of the segment (inclusive).
    start: usize,
    /// Last index of the segment (exclusive).
    end: usize,
}

impl Segment {
    /// Creates an empty segment, to be filled by a chunk source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the sub-collection this segment belongs to.
    pub fn list(&self) -> usize {
        self.list
    }

    /// First index of the segment (inclusive).
    pub fn start(&self) -> usize {
        self.start
    }

    /// Last index of the segment (exclusive).
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of indices in this segment.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether this segment contains no index.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The indices of this segment as a [`std::ops::Range`].
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// Resets this segment in place.
    #[inline(always)]
    fn reset(&mut self, list: usize, start: usize, end: usize) {
        debug_assert!(start < end);
        self.list = list;
        self.start = start;
        self.end = end;
    }
}

/// A source of chunks of work that can be borrowed concurrently.
///
/// # Contract
///
/// Implementers guarantee that, across all calls from any number of threads,
/// the segments returned until exhaustion (for a given sub-collection) are
/// pairwise disjoint and their union is the full index range of that
/// sub-collection. Once [`borrow()`](Self::borrow) has returned [`None`], all
/// subsequent calls from any thread return [`None`] as well.
pub trait ChunkSource: Send + Sync {
    /// Borrows the next chunk of work, writing it into the given segment.
    ///
    /// Returns [`None`] once all the work has been handed out. The returned
    /// reference is tied to the given segment, so it cannot outlive the next
    /// call that reuses the segment.
    fn borrow<'s>(&self, segment: &'s mut Segment) -> Option<&'s Segment>;

    /// Total number of items covered by this source.
    fn len(&self) -> usize;

    /// Whether this source covers no item at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximal number of items in a chunk.
    fn chunk_size(&self) -> usize;

    /// Estimates the number of chunks that haven't been handed out yet.
    ///
    /// This is only a hint: concurrent borrowers may exhaust the source right
    /// after this returns a non-zero value.
    fn remaining_chunks(&self) -> usize;
}

/// Computes `ceil(len / chunk_size)` for a non-zero chunk size.
#[inline(always)]
fn chunks_in(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size)
}

/// Longest collection for which a cursor is bumped with a plain `fetch_add()`.
const FETCH_ADD_MAX_LEN: usize = usize::MAX >> 16;

/// Claims the next chunk of `0..len` from the given cursor, returning its start.
///
/// The cursor is checked before being bumped, so each thread bumps an exhausted
/// cursor at most once: the call during which exhaustion happened. With a chunk
/// size capped to `len`, a cursor over at most [`FETCH_ADD_MAX_LEN`] items stays
/// below `len * (1 + threads)` and can't overflow with fewer than `2^16`
/// concurrent threads. Longer collections use a compare-and-set that never moves
/// the cursor past `len`.
#[inline(always)]
fn claim_chunk(cursor: &AtomicUsize, len: usize, chunk_size: usize) -> Option<usize> {
    if cursor.load(Ordering::Relaxed) >= len {
        return None;
    }
    let start = if len <= FETCH_ADD_MAX_LEN {
        cursor.fetch_add(chunk_size, Ordering::Relaxed)
    } else {
        cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |start| {
                (start < len).then(|| start.saturating_add(chunk_size).min(len))
            })
            .ok()?
    };
    (start < len).then_some(start)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::sync::Barrier;

    /// Borrows from the given source on `num_threads` threads until exhaustion
    /// and returns all the segments that were handed out.
    pub(super) fn collect_concurrently(
        source: &dyn ChunkSource,
        num_threads: usize,
    ) -> Vec<Segment> {
        let barrier = Barrier::new(num_threads);
        std::thread::scope(|scope| {
            let handles = (0..num_threads)
                .map(|_| {
                    scope.spawn(|| {
                        let mut segments = Vec::new();
                        let mut segment = Segment::new();
                        barrier.wait();
                        while let Some(s) = source.borrow(&mut segment) {
                            segments.push(s.clone());
                        }
                        // Exhaustion is permanent.
                        for _ in 0..10 {
                            assert!(source.borrow(&mut segment).is_none());
                        }
                        segments
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        })
    }

    /// Asserts that the segments of the given list tile `0..len`.
    pub(super) fn assert_tiles(segments: &[Segment], list: usize, len: usize, chunk_size: usize) {
        let mut ranges = segments
            .iter()
            .filter(|s| s.list() == list)
            .map(|s| s.range())
            .collect::<Vec<_>>();
        ranges.sort_by_key(|r| r.start);
        let mut expected_start = 0;
        for range in &ranges {
            assert_eq!(range.start, expected_start, "gap or overlap at {range:?}");
            assert!(!range.is_empty());
            assert!(range.len() <= chunk_size);
            expected_start = range.end;
        }
        assert_eq!(expected_start, len);
    }

    #[test]
    fn test_segment_accessors() {
        let mut segment = Segment::new();
        assert!(segment.is_empty());
        segment.reset(2, 5, 9);
        assert_eq!(segment.list(), 2);
        assert_eq!(segment.range(), 5..9);
        assert_eq!(segment.len(), 4);
        assert!(!segment.is_empty());
    }

    #[test]
    fn test_random_lengths_tile_exactly() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..50 {
            let len = rng.random_range(0..5_000);
            let chunk_size = rng.random_range(1..300);
            let num_threads = rng.random_range(1..8);
            let source = ListChunkSource::new(len, chunk_size);
            let segments = collect_concurrently(&source, num_threads);
            assert_tiles(&segments, 0, len, chunk_size);
            assert_eq!(source.remaining_chunks(), 0);
        }
    }

    #[test]
    fn test_random_composites_tile_exactly() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..50 {
            let lengths = (0..rng.random_range(0..6))
                .map(|_| rng.random_range(0..2_000))
                .collect::<Vec<usize>>();
            let chunk_size = rng.random_range(1..200);
            let num_threads = rng.random_range(1..8);
            let source = CompositeChunkSource::new(lengths.iter().copied(), chunk_size);
            let segments = collect_concurrently(&source, num_threads);
            for (list, &len) in lengths.iter().enumerate() {
                assert_tiles(&segments, list, len, chunk_size);
            }
            assert!(segments.iter().all(|s| s.list() < lengths.len()));
            assert_eq!(source.remaining_chunks(), 0);
        }
    }
}
