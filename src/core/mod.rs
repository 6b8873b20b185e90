// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: tasks, task factories, worker pool and synchronization
//! primitives.

mod catching;
mod factory;
mod sync;
mod task;
mod thread_pool;
pub(crate) mod util;

pub use catching::{catch_failure, CatchingThread};
pub use factory::{CooperativeFactory, FixedCountFactory, TaskFactory};
pub use sync::Latch;
pub use task::{Task, TaskState};
pub use thread_pool::{CpuPinningPolicy, ThreadCount, WorkerPool, WorkerPoolBuilder};
