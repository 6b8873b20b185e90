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

/// A chunk source over a single indexed collection (list or array).
pub struct ListChunkSource {
    /// Number of items in the collection.
    len: usize,
    /// Number of items handed out per chunk.
    chunk_size: usize,
    /// Start of the next chunk to hand out. This only ever increases.
    cursor: CachePadded<AtomicUsize>,
}

// Here is a proof that `ListChunkSource` upholds the contract of
// `ChunkSource`.
//
// Each call to `borrow()` that finds the cursor below `len` performs one atomic
// update of the cursor (see `claim_chunk()`), so each such call observes a
// distinct previous value `prev`, and the values below `len` are exactly the
// multiples of `chunk_size` in increasing order. The segment
// `prev..min(prev + chunk_size, len)` is returned if and only if `prev < len`.
// Therefore the returned segments are the consecutive chunks of `0..len`, each
// returned exactly once.
//
// The cursor never wraps around: `claim_chunk()` bounds how far it can move
// past `len`. So once a call observes `prev >= len`, all later calls observe a
// value at least as large and return `None` as well.
impl ListChunkSource {
    /// Creates a chunk source over `len` items, handing out up to
    /// `chunk_size` items at a time. A chunk size of 0 is treated as 1.
    pub fn new(len: usize, chunk_size: usize) -> Self {
        Self {
            len,
            chunk_size: chunk_size.clamp(1, len.max(1)),
            cursor: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a chunk source over all the items of the given collection.
    pub fn over(collection: &(impl IndexedSource + ?Sized), chunk_size: usize) -> Self {
        Self::new(collection.source_len(), chunk_size)
    }
}

impl ChunkSource for ListChunkSource {
    #[inline]
    fn borrow<'s>(&self, segment: &'s mut Segment) -> Option<&'s Segment> {
        let start = claim_chunk(&self.cursor, self.len, self.chunk_size)?;
        let end = self.len.min(start.saturating_add(self.chunk_size));
        #[cfg(feature = "log_parallelism")]
        log_trace!("Borrowed chunk {start}..{end} of {}", self.len);
        segment.reset(0, start, end);
        Some(segment)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn remaining_chunks(&self) -> usize {
        let cursor = self.cursor.load(Ordering::Relaxed);
        chunks_in(self.len.saturating_sub(cursor), self.chunk_size)
    }
}
