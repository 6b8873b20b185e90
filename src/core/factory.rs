// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task factories: producers of tasks that the calling thread and the worker
//! pool execute cooperatively.

use super::sync::Latch;
use super::task::{Task, TaskListener};
use super::thread_pool::WorkerPool;
use crate::error::{BoxError, Error, Result, TaskFailure};
use crate::macros::{log_debug, log_warn};
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// A producer of tasks, shared between the thread that started it and the
/// worker threads of a pool.
pub trait TaskFactory: Send + Sync {
    /// Hands out the next task, or [`None`] if there is no more work.
    fn create_task(&self) -> Option<Arc<Task>>;

    /// Runs tasks on the calling thread (and on the pool) until all the
    /// generated tasks have finished, then returns the first failure observed
    /// in any of them.
    fn start_and_work_until_finished(&self) -> Result<()>;
}

/// Submits the factory, which has `remaining` tasks left, to the pool. If the
/// pool refuses it, the calling thread ends up running every task itself.
fn submit_or_work_alone(pool: &WorkerPool, factory: Arc<dyn TaskFactory>, remaining: usize) {
    if let Err(_e) = pool.submit_task_factory_with_tasks(factory, remaining) {
        log_warn!("Running all the tasks on the calling thread: {_e}");
    }
}

/// A factory over a fixed array of pre-built tasks.
///
/// The last task of the array is always run by the thread calling
/// [`start_and_work_until_finished()`](TaskFactory::start_and_work_until_finished),
/// so the pool is notified that the factory is done as soon as the
/// second-to-last task has been handed out.
pub struct FixedCountFactory {
    pool: WorkerPool,
    this: Weak<FixedCountFactory>,
    tasks: Box<[Arc<Task>]>,
    /// Index of the next task to hand out.
    next: CachePadded<AtomicUsize>,
    /// First failure reported by a task.
    failure: OnceLock<TaskFailure>,
}

impl FixedCountFactory {
    /// Creates a factory handing out the given tasks.
    pub fn new(pool: WorkerPool, tasks: Vec<Arc<Task>>) -> Arc<Self> {
        let factory = Arc::new_cyclic(|this: &Weak<Self>| Self {
            pool,
            this: this.clone(),
            tasks: tasks.into_boxed_slice(),
            next: CachePadded::new(AtomicUsize::new(0)),
            failure: OnceLock::new(),
        });
        let listener: Weak<dyn TaskListener> = factory.this.clone();
        for task in factory.tasks.iter() {
            if !task.bind_listener(listener.clone()) {
                log_warn!("Task {task:?} is already bound to another factory");
            }
        }
        factory
    }

    /// Number of tasks in this factory.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether this factory has no task at all.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn this(&self) -> Option<Arc<dyn TaskFactory>> {
        self.this.upgrade().map(|this| this as Arc<dyn TaskFactory>)
    }
}

impl TaskFactory for FixedCountFactory {
    fn create_task(&self) -> Option<Arc<Task>> {
        // Only the first `n - 1` tasks are handed out, the last one is reserved
        // for the calling thread.
        let eligible = self.tasks.len().checked_sub(1)?;
        if self.next.load(Ordering::Relaxed) >= eligible {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        if index >= eligible {
            return None;
        }
        if index + 1 == eligible {
            // Exactly one thread observes the last eligible index.
            if let Some(this) = self.this() {
                self.pool.set_factory_done(&this);
            }
        }
        Some(self.tasks[index].clone())
    }

    fn start_and_work_until_finished(&self) -> Result<()> {
        let Some(last) = self.tasks.last() else {
            return Ok(());
        };
        if self.tasks.len() > 1 {
            if let Some(this) = self.this() {
                submit_or_work_alone(&self.pool, this, self.tasks.len() - 1);
            }
        }

        last.run();
        while let Some(task) = self.create_task() {
            task.run();
        }
        for task in self.tasks.iter() {
            task.wait_until_done_ignoring_exceptions();
        }

        // Tasks bound to another listener only record their failure on
        // themselves.
        let failure = self
            .failure
            .get()
            .or_else(|| self.tasks.iter().find_map(|task| task.failure()));
        match failure {
            Some(failure) => Err(Error::from(failure.clone())),
            None => Ok(()),
        }
    }
}

impl TaskListener for FixedCountFactory {
    fn task_finished(&self, failure: Option<&TaskFailure>) {
        if let Some(failure) = failure {
            if self.failure.set(failure.clone()).is_err() {
                log_debug!("Dropping subsequent failure: {failure}");
            }
        }
    }
}

/// Packed factory state: `uncreated` in the low 16 bits, `busy` in the high
/// 16 bits.
#[derive(Clone, Copy, PartialEq, Eq)]
struct PackedState(u32);

impl PackedState {
    const SHIFT: u32 = 16;
    const MASK: u32 = 0xFFFF;

    fn new(uncreated: u32, busy: u32) -> Self {
        debug_assert!(uncreated <= Self::MASK && busy <= Self::MASK);
        PackedState(uncreated | (busy << Self::SHIFT))
    }

    fn uncreated(self) -> u32 {
        self.0 & Self::MASK
    }

    fn busy(self) -> u32 {
        self.0 >> Self::SHIFT
    }
}

type SharedBody = dyn Fn(usize) -> std::result::Result<(), BoxError> + Send + Sync + 'static;

/// A factory producing up to a fixed number of identical tasks, for work whose
/// split is decided lazily by the tasks themselves (typically by borrowing
/// chunks from a shared [`ChunkSource`](crate::ChunkSource)).
///
/// The factory tracks the number of tasks not created yet (`uncreated`) and
/// the number of tasks created but not finished yet (`busy`) in a single
/// atomic word. Its completion latch opens once both reach zero, or once the
/// factory is killed. A failure in any task kills the factory, so that the
/// caller is released with that failure without waiting for the tasks that
/// haven't been created yet.
pub struct CooperativeFactory {
    pool: WorkerPool,
    this: Weak<CooperativeFactory>,
    task_count: u32,
    state: CachePadded<AtomicU32>,
    body: Arc<SharedBody>,
    kill_cause: OnceLock<TaskFailure>,
    done: Latch,
}

impl CooperativeFactory {
    /// Creates a factory producing `task_count` tasks, each running the given
    /// body with the index of the task (in creation order).
    ///
    /// # Panics
    ///
    /// Panics if `task_count` exceeds [`u16::MAX`], as the task counters are
    /// packed in 16 bits each.
    pub fn new(
        pool: WorkerPool,
        task_count: usize,
        body: impl Fn(usize) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let task_count = match u16::try_from(task_count) {
            Ok(count) => u32::from(count),
            Err(_) => panic!(
                "A cooperative factory supports at most {} tasks, got {task_count}",
                u16::MAX
            ),
        };
        let factory = Arc::new_cyclic(|this: &Weak<Self>| Self {
            pool,
            this: this.clone(),
            task_count,
            state: CachePadded::new(AtomicU32::new(PackedState::new(task_count, 0).0)),
            body: Arc::new(body),
            kill_cause: OnceLock::new(),
            done: Latch::new(),
        });
        if task_count == 0 {
            factory.done.release();
        }
        factory
    }

    fn load(&self) -> PackedState {
        PackedState(self.state.load(Ordering::Acquire))
    }

    /// Number of tasks that haven't been created yet.
    pub fn uncreated(&self) -> usize {
        self.load().uncreated() as usize
    }

    /// Number of tasks that have been created but haven't finished yet.
    pub fn busy(&self) -> usize {
        self.load().busy() as usize
    }

    /// Whether the factory has been killed.
    pub fn is_killed(&self) -> bool {
        self.kill_cause.get().is_some()
    }

    /// Kills the factory: no more tasks will be created, and the thread
    /// waiting in
    /// [`start_and_work_until_finished()`](TaskFactory::start_and_work_until_finished)
    /// is released with the given cause, even if some tasks are still running.
    ///
    /// Only the first cause is recorded.
    pub fn kill(&self, cause: TaskFailure) {
        // Clearing both counters in one step makes any later `create_task()`
        // fail, including one racing with this call. The word is cleared
        // before the cause is set, so no task is created once `is_killed()`
        // is observed.
        let _previous = PackedState(self.state.swap(0, Ordering::AcqRel));
        log_debug!(
            "Killing factory with {} uncreated and {} busy tasks",
            _previous.uncreated(),
            _previous.busy()
        );
        if let Err(_cause) = self.kill_cause.set(cause) {
            log_debug!("Factory already killed, dropping cause: {_cause}");
        }
        self.done.release();
    }

    /// Records the completion of a task.
    fn task_done(&self) {
        let backoff = Backoff::new();
        let mut state = self.load();
        loop {
            // A kill may have drained the busy count already.
            if state.busy() == 0 {
                return;
            }
            let next = PackedState::new(state.uncreated(), state.busy() - 1);
            match self.state.compare_exchange_weak(
                state.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next.0 == 0 && self.done.release() {
                        log_debug!("All {} tasks of the factory are done", self.task_count);
                    }
                    return;
                }
                Err(updated) => {
                    state = PackedState(updated);
                    backoff.spin();
                }
            }
        }
    }

    fn this(&self) -> Option<Arc<dyn TaskFactory>> {
        self.this.upgrade().map(|this| this as Arc<dyn TaskFactory>)
    }
}

impl TaskFactory for CooperativeFactory {
    fn create_task(&self) -> Option<Arc<Task>> {
        let backoff = Backoff::new();
        let mut state = self.load();
        let index = loop {
            // A kill clears `uncreated`.
            if state.uncreated() == 0 {
                return None;
            }
            let next = PackedState::new(state.uncreated() - 1, state.busy() + 1);
            match self.state.compare_exchange_weak(
                state.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (self.task_count - state.uncreated()) as usize,
                Err(updated) => {
                    state = PackedState(updated);
                    backoff.spin();
                }
            }
        };

        let body = self.body.clone();
        let listener: Weak<dyn TaskListener> = self.this.clone();
        Some(Arc::new(Task::with_listener(move || body(index), listener)))
    }

    fn start_and_work_until_finished(&self) -> Result<()> {
        let this = self.this();
        if let Some(first) = self.create_task() {
            let remaining = self.uncreated();
            if remaining > 0 {
                if let Some(this) = &this {
                    submit_or_work_alone(&self.pool, this.clone(), remaining);
                }
            }
            first.run();
            // Keep working rather than only waiting, so that progress doesn't
            // depend on the pool having a free thread.
            while let Some(task) = self.create_task() {
                task.run();
            }
        }

        self.done.wait();
        if let Some(this) = &this {
            self.pool.set_factory_done(this);
        }

        match self.kill_cause.get() {
            Some(cause) => Err(Error::from(cause.clone())),
            None => Ok(()),
        }
    }
}

impl TaskListener for CooperativeFactory {
    fn task_finished(&self, failure: Option<&TaskFailure>) {
        if let Some(failure) = failure {
            self.kill(failure.clone());
        }
        self.task_done();
    }
}
