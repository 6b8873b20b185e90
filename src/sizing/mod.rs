// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Heuristics to size parallel work: how many threads and how large chunks to
//! use, how large a filtered output is expected to be, and how to fill a
//! pre-sized output buffer from several producers.

mod chunk_size;
mod estimate;
mod partition;

pub use chunk_size::{ThreadChunkSize, TARGET_CHUNK_WEIGHT};
pub use estimate::{estimate_result_size, SAMPLE_SIZE_1, SAMPLE_SIZE_2};
pub use partition::{Count, PartitionFiller};
