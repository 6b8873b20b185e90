// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

pub mod chunk;
mod core;
mod error;
mod macros;
pub mod queue;
pub mod sizing;

pub use chunk::{ChunkSource, CompositeChunkSource, IndexedSource, ListChunkSource, Segment};
pub use core::{
    catch_failure, CatchingThread, CooperativeFactory, CpuPinningPolicy, FixedCountFactory, Latch,
    Task, TaskFactory, TaskState, ThreadCount, WorkerPool, WorkerPoolBuilder,
};
pub use error::{BoxError, Error, Result, TaskFailure};
pub use queue::PeekableQueue;
pub use sizing::{estimate_result_size, PartitionFiller, ThreadChunkSize};
