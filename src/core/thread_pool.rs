// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A bounded pool of worker threads, spawned on demand and retired after an
//! idle timeout.

use super::factory::{CooperativeFactory, TaskFactory};
use super::task::Task;
use super::util::Status;
use crate::chunk::{ChunkSource, CompositeChunkSource, ListChunkSource, Segment};
use crate::error::{BoxError, Error, Result};
#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_warn};
use crate::queue::PeekableQueue;
use crate::sizing::ThreadChunkSize;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::Cell;
use std::convert::TryFrom;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Maximal number of threads to spawn in a worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn up to the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn up to the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> std::result::Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

impl ThreadCount {
    fn resolve(self) -> usize {
        match self {
            ThreadCount::AvailableParallelism => match std::thread::available_parallelism() {
                Ok(count) => count.get(),
                Err(_e) => {
                    log_warn!("Getting the available parallelism failed, using 1 thread: {_e}");
                    1
                }
            },
            ThreadCount::Count(count) => count.get(),
        }
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a worker pool will panic.
    Always,
}

/// A builder for [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerPoolBuilder {
    /// Maximal number of worker threads alive at any time.
    pub max_threads: ThreadCount,
    /// Duration after which a worker thread without work exits.
    pub idle_timeout: Duration,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Prefix of the worker thread names.
    pub thread_name: String,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            max_threads: ThreadCount::AvailableParallelism,
            idle_timeout: Duration::from_secs(10),
            cpu_pinning: CpuPinningPolicy::No,
            thread_name: "chunkpool-worker".to_owned(),
        }
    }
}

impl WorkerPoolBuilder {
    /// Creates a worker pool. No thread is spawned until work is submitted.
    ///
    /// ```
    /// # use chunkpool::{CpuPinningPolicy, ThreadCount, WorkerPoolBuilder};
    /// # use std::time::Duration;
    /// let pool = WorkerPoolBuilder {
    ///     max_threads: ThreadCount::try_from(4).unwrap(),
    ///     idle_timeout: Duration::from_secs(1),
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     thread_name: "doc-worker".to_owned(),
    /// }
    /// .build();
    ///
    /// pool.execute_and_wait(|| Ok(())).unwrap();
    /// assert_eq!(pool.max_threads(), 4);
    /// ```
    pub fn build(&self) -> WorkerPool {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match self.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let max_threads = self.max_threads.resolve();
        log_debug!(
            "Created worker pool {} with up to {max_threads} threads",
            self.thread_name
        );
        let shared = Arc::new(PoolShared {
            name: self.thread_name.clone(),
            max_threads,
            idle_timeout: self.idle_timeout,
            cpu_pinning: self.cpu_pinning,
            queue: PeekableQueue::new(),
            threads: Status::new(Threads {
                live: 0,
                idle: 0,
                free_slots: (0..max_threads).rev().collect(),
                handles: (0..max_threads).map(|_| None).collect(),
                #[cfg(feature = "log_parallelism")]
                total_spawned: 0,
                #[cfg(feature = "log_parallelism")]
                peak_live: 0,
            }),
        });
        WorkerPool {
            handle: Arc::new(PoolHandle { shared }),
        }
    }
}

/// A unit of work queued in the pool.
#[derive(Clone)]
enum Job {
    /// A factory, from which every worker thread takes tasks until it is
    /// exhausted.
    Factory(Arc<dyn TaskFactory>),
    /// A single task, run by one worker thread.
    Task(Arc<Task>),
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Job::Factory(a), Job::Factory(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Job::Task(a), Job::Task(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Bookkeeping of the worker threads.
struct Threads {
    /// Number of threads that are alive.
    live: usize,
    /// Number of threads waiting for a job.
    idle: usize,
    /// Slots not used by a live thread. A thread's slot is also the index of
    /// the CPU it's pinned to.
    free_slots: Vec<usize>,
    /// Handle of the last thread that used each slot.
    handles: Vec<Option<JoinHandle<()>>>,
    /// Number of threads spawned since the pool was created.
    #[cfg(feature = "log_parallelism")]
    total_spawned: usize,
    /// Maximal number of threads alive at the same time.
    #[cfg(feature = "log_parallelism")]
    peak_live: usize,
}

/// State shared by all the handles of a pool and its worker threads.
struct PoolShared {
    name: String,
    max_threads: usize,
    idle_timeout: Duration,
    cpu_pinning: CpuPinningPolicy,
    queue: PeekableQueue<Job>,
    threads: Status<Threads>,
}

thread_local! {
    /// Whether the current thread is a worker thread of some pool.
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

impl PoolShared {
    /// Queues a job and spawns up to `wanted` new threads for it, unless idle
    /// threads can pick it up.
    fn submit(self: &Arc<Self>, job: Job, wanted: usize) -> Result<()> {
        if !self.queue.add(job) {
            return Err(Error::PoolShutdown);
        }

        let mut threads = self.threads.lock();
        let spawn = wanted
            .saturating_sub(threads.idle)
            .min(self.max_threads - threads.live);
        let mut retired = Vec::new();
        for _ in 0..spawn {
            let Some(slot) = threads.free_slots.pop() else {
                break;
            };
            // The previous owner of this slot has already released it, and is
            // about to return.
            if let Some(previous) = threads.handles[slot].take() {
                retired.push((slot, previous));
            }
            let shared = self.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{slot}", self.name))
                .spawn(move || shared.worker_main(slot));
            match spawned {
                Ok(handle) => {
                    threads.handles[slot] = Some(handle);
                    threads.live += 1;
                    #[cfg(feature = "log_parallelism")]
                    {
                        threads.total_spawned += 1;
                        threads.peak_live = threads.peak_live.max(threads.live);
                    }
                    log_debug!(
                        "[pool {}] Spawned worker thread #{slot} ({} alive)",
                        self.name,
                        threads.live
                    );
                }
                Err(_e) => {
                    // Callers always work on their own jobs, so a shortage of
                    // threads only reduces parallelism.
                    log_error!("[pool {}] Failed to spawn a worker thread: {_e}", self.name);
                    threads.free_slots.push(slot);
                    break;
                }
            }
        }
        drop(threads);

        for (_slot, previous) in retired {
            if previous.join().is_err() {
                log_error!("[pool {}] Worker thread #{_slot} panicked", self.name);
            }
        }
        Ok(())
    }

    fn worker_main(self: Arc<Self>, slot: usize) {
        IS_WORKER.with(|is_worker| is_worker.set(true));
        let mut exit = WorkerExit {
            shared: &self,
            slot,
            retired: false,
        };
        self.pin_to_cpu(slot);

        loop {
            self.threads.lock().idle += 1;
            let job = self.queue.peek_timeout(self.idle_timeout);
            {
                let mut threads = self.threads.lock();
                threads.idle -= 1;
                // The queue is checked under the lock, so a job submitted
                // concurrently either sees this thread as idle or is seen here.
                if job.is_none() && self.queue.is_empty() {
                    threads.live -= 1;
                    threads.free_slots.push(slot);
                    exit.retired = true;
                    log_debug!(
                        "[pool {}] Worker thread #{slot} exiting ({} alive)",
                        self.name,
                        threads.live
                    );
                    break;
                }
            }
            match job {
                Some(Job::Factory(factory)) => {
                    while let Some(task) = factory.create_task() {
                        task.run();
                    }
                    self.queue.remove_if_same(&Job::Factory(factory));
                }
                Some(Job::Task(task)) => {
                    self.queue.remove_if_same(&Job::Task(task.clone()));
                    // Only the first thread to claim the task runs it.
                    task.run();
                }
                None => (),
            }
        }
    }

    #[allow(unused_variables)]
    fn pin_to_cpu(&self, slot: usize) {
        #[cfg(all(
            not(miri),
            any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            )
        ))]
        match self.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                let mut cpu_set = CpuSet::new();
                if let Err(_e) = cpu_set.set(slot) {
                    log_warn!("Failed to set CPU affinity for thread #{slot}: {_e}");
                } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    log_warn!("Failed to set CPU affinity for thread #{slot}: {_e}");
                } else {
                    log_debug!("Pinned thread #{slot} to CPU #{slot}");
                }
            }
            CpuPinningPolicy::Always => {
                let mut cpu_set = CpuSet::new();
                if let Err(e) = cpu_set.set(slot) {
                    panic!("Failed to set CPU affinity for thread #{slot}: {e}");
                } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    panic!("Failed to set CPU affinity for thread #{slot}: {e}");
                } else {
                    log_debug!("Pinned thread #{slot} to CPU #{slot}");
                }
            }
        }
    }
}

/// Object whose destructor releases the slot of a worker thread that didn't
/// retire normally (i.e. that panicked).
struct WorkerExit<'a> {
    shared: &'a PoolShared,
    slot: usize,
    retired: bool,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        if self.retired {
            return;
        }
        log_error!(
            "[pool {}] Detected panic in worker thread #{}",
            self.shared.name,
            self.slot
        );
        let mut threads = self.shared.threads.lock();
        threads.live -= 1;
        threads.free_slots.push(self.slot);
    }
}

/// Owner of the pool's shared state, shutting the pool down once the last
/// [`WorkerPool`] handle is dropped.
struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl Drop for PoolHandle {
    /// Joins all the threads in the pool.
    fn drop(&mut self) {
        self.shared.queue.close();

        let current = std::thread::current().id();
        let handles = self
            .shared
            .threads
            .lock()
            .handles
            .iter_mut()
            .filter_map(Option::take)
            .collect::<Vec<_>>();
        log_debug!("[pool {}] Joining threads in the pool...", self.shared.name);
        for handle in handles {
            if handle.thread().id() == current {
                // Dropped from one of its own workers, which exits on its own.
                continue;
            }
            let result = handle.join();
            match result {
                Ok(_) => log_debug!("[pool {}] Thread joined", self.shared.name),
                Err(_) => log_error!("[pool {}] Thread joined with a panic", self.shared.name),
            }
        }
        log_debug!("[pool {}] Joined threads.", self.shared.name);

        #[cfg(feature = "log_parallelism")]
        {
            let threads = self.shared.threads.lock();
            log_info!(
                "[pool {}] Spawned {} threads in total, at most {} at a time",
                self.shared.name,
                threads.total_spawned,
                threads.peak_live
            );
        }
    }
}

/// A handle to a pool of worker threads executing tasks and task factories.
///
/// Handles are cheap to clone, and all refer to the same pool. The pool shuts
/// down once [`shutdown()`](Self::shutdown) is called or the last handle is
/// dropped.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Arc<PoolHandle>,
}

impl WorkerPool {
    fn shared(&self) -> &Arc<PoolShared> {
        &self.handle.shared
    }

    /// Maximal number of worker threads in this pool.
    pub fn max_threads(&self) -> usize {
        self.shared().max_threads
    }

    /// Number of worker threads currently alive.
    pub fn live_threads(&self) -> usize {
        self.shared().threads.lock().live
    }

    /// Registers a factory, from which worker threads will take tasks until it
    /// runs out of them.
    pub fn submit_task_factory(&self, factory: Arc<dyn TaskFactory>) -> Result<()> {
        self.submit_task_factory_with_tasks(factory, self.max_threads())
    }

    /// Registers a factory with `remaining` tasks left to hand out. No more
    /// threads than that are spawned for it.
    pub(crate) fn submit_task_factory_with_tasks(
        &self,
        factory: Arc<dyn TaskFactory>,
        remaining: usize,
    ) -> Result<()> {
        let wanted = remaining.min(self.max_threads());
        self.shared().submit(Job::Factory(factory), wanted)
    }

    /// Number of jobs waiting in the queue.
    #[cfg(test)]
    pub(crate) fn queued_jobs(&self) -> usize {
        self.shared().queue.len()
    }

    /// Unregisters a factory, so that worker threads stop asking it for tasks.
    /// Returns false if the factory wasn't at the head of the queue, e.g.
    /// because it was already removed.
    pub fn set_factory_done(&self, factory: &Arc<dyn TaskFactory>) -> bool {
        self.shared()
            .queue
            .remove_if_same(&Job::Factory(factory.clone()))
    }

    fn submit_task(
        &self,
        f: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    ) -> Result<Arc<Task>> {
        let task = Arc::new(Task::new(f));
        self.shared().submit(Job::Task(task.clone()), 1)?;
        Ok(task)
    }

    /// Runs the given function on a worker thread, without waiting for it. A
    /// failure of the function is logged.
    pub fn execute(
        &self,
        f: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    ) -> Result<()> {
        self.submit_task(f).map(|_| ())
    }

    /// Runs the given function on a worker thread and waits for it, returning
    /// its failure if any.
    ///
    /// When called from a worker thread, the function may run on the calling
    /// thread instead, so that waiting never starves the pool.
    pub fn execute_and_wait(
        &self,
        f: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    ) -> Result<()> {
        let task = self.submit_task(f)?;
        if IS_WORKER.with(Cell::get) {
            task.run();
        }
        task.wait_until_done_with_exception_handling()
    }

    /// Runs the given function on a worker thread and waits for it, ignoring its
    /// failure.
    pub fn execute_and_wait_ignoring_errors(
        &self,
        f: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    ) -> Result<()> {
        let task = self.submit_task(f)?;
        if IS_WORKER.with(Cell::get) {
            task.run();
        }
        task.wait_until_done_ignoring_exceptions();
        Ok(())
    }

    /// Stops accepting new work. Worker threads finish the jobs already queued,
    /// then exit.
    pub fn shutdown(&self) {
        log_debug!("[pool {}] Shutting down", self.shared().name);
        self.shared().queue.close();
    }

    /// Whether [`shutdown()`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shared().queue.is_closed()
    }

    /// Calls `f` on every chunk of the given source, on up to `threads` threads
    /// including the calling one. Returns the first failure of `f`, once no
    /// more chunks are handed out.
    pub fn for_each_chunk<S: ChunkSource + 'static>(
        &self,
        source: Arc<S>,
        threads: usize,
        f: impl Fn(&Segment) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Result<()> {
        let tasks = threads
            .max(1)
            .min(source.remaining_chunks())
            .min(usize::from(u16::MAX));
        if tasks == 0 {
            return Ok(());
        }
        let factory = CooperativeFactory::new(self.clone(), tasks, move |_| {
            let mut segment = Segment::new();
            while let Some(chunk) = source.borrow(&mut segment) {
                f(chunk)?;
            }
            Ok(())
        });
        factory.start_and_work_until_finished()
    }

    /// Calls `f` on chunks covering `0..len`, with a number of threads and a
    /// chunk size derived from the relative cost of each item.
    pub fn for_each_chunk_sized(
        &self,
        len: usize,
        per_item_weight: f64,
        f: impl Fn(&Segment) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Result<()> {
        // The calling thread works alongside the pool.
        let sizing = ThreadChunkSize::new(self.max_threads() + 1, len, per_item_weight);
        let source = ListChunkSource::new(len, sizing.chunk_size());
        self.for_each_chunk(Arc::new(source), sizing.threads(), f)
    }

    /// Calls `f` on chunks covering all the given sub-collections in order,
    /// with a number of threads and a chunk size derived from their total
    /// length and the relative cost of each item.
    pub fn for_each_chunk_composite(
        &self,
        lengths: impl IntoIterator<Item = usize>,
        per_item_weight: f64,
        f: impl Fn(&Segment) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Result<()> {
        let lengths = lengths.into_iter().collect::<Vec<_>>();
        let total = lengths.iter().sum::<usize>();
        let sizing = ThreadChunkSize::new(self.max_threads() + 1, total, per_item_weight);
        let source = CompositeChunkSource::new(lengths, sizing.chunk_size());
        self.for_each_chunk(Arc::new(source), sizing.threads(), f)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared().name)
            .field("max_threads", &self.max_threads())
            .field("live_threads", &self.live_threads())
            .finish_non_exhaustive()
    }
}
