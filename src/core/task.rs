// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A unit of work that is claimed and run at most once.

use super::catching::catch_failure;
use super::sync::Latch;
use crate::error::{BoxError, Error, Result, TaskFailure};
use crate::macros::{log_error, log_warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, Weak};

/// Lifecycle of a [`Task`]. Transitions are one-way:
/// `NotClaimed -> Claimed -> Finished`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// No thread has started running the task yet.
    NotClaimed = 0,
    /// A thread is running the task.
    Claimed = 1,
    /// The task body has returned (successfully or not).
    Finished = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::NotClaimed,
            1 => TaskState::Claimed,
            _ => TaskState::Finished,
        }
    }
}

/// Receives the completion of the tasks bound to it.
pub(crate) trait TaskListener: Send + Sync {
    /// Called exactly once per bound task, after the task has finished.
    fn task_finished(&self, failure: Option<&TaskFailure>);
}

type TaskBody = Box<dyn FnOnce() -> std::result::Result<(), BoxError> + Send + 'static>;

/// A unit of work, runnable by any thread but executed at most once.
///
/// Whichever thread first calls [`run()`](Self::run) claims the task and
/// executes its body; later calls return immediately. Failures of the body
/// (returned errors as well as panics) are captured and recorded on the task,
/// which always reaches [`TaskState::Finished`] so that waiters are never left
/// hanging.
pub struct Task {
    state: AtomicU8,
    body: Mutex<Option<TaskBody>>,
    failure: OnceLock<TaskFailure>,
    done: Latch,
    listener: OnceLock<Weak<dyn TaskListener>>,
}

impl Task {
    /// Creates a task running the given body.
    pub fn new(body: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static) -> Self {
        Self {
            state: AtomicU8::new(TaskState::NotClaimed as u8),
            body: Mutex::new(Some(Box::new(body))),
            failure: OnceLock::new(),
            done: Latch::new(),
            listener: OnceLock::new(),
        }
    }

    /// Creates a task whose completion is reported to the given listener.
    pub(crate) fn with_listener(
        body: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
        listener: Weak<dyn TaskListener>,
    ) -> Self {
        let task = Self::new(body);
        // A fresh task has no listener yet.
        let _ = task.listener.set(listener);
        task
    }

    /// Binds this task to a listener. Returns false if a listener was already
    /// bound, in which case the given one is ignored.
    pub(crate) fn bind_listener(&self, listener: Weak<dyn TaskListener>) -> bool {
        self.listener.set(listener).is_ok()
    }

    /// Runs the task body on the calling thread, unless another thread has
    /// already claimed it.
    pub fn run(&self) {
        if self
            .state
            .compare_exchange(
                TaskState::NotClaimed as u8,
                TaskState::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        // The lock only guards the hand-off of the body, which runs unlocked.
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let failure = match body {
            Some(body) => catch_failure(body).err(),
            None => {
                log_warn!("Claimed a task without a body");
                None
            }
        };
        if let Some(failure) = &failure {
            log_error!("Task failed: {failure}");
            // Only the claiming thread records a failure, so this never fails.
            let _ = self.failure.set(failure.clone());
        }

        self.state
            .store(TaskState::Finished as u8, Ordering::Release);
        // The listener must have seen the failure by the time waiters wake up.
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.task_finished(failure.as_ref());
        }
        self.done.release();
    }

    /// Blocks until the task has finished, then returns the failure of its
    /// body, if any.
    pub fn wait_until_done_with_exception_handling(&self) -> Result<()> {
        self.done.wait();
        match self.failure.get() {
            Some(failure) => Err(Error::from(failure.clone())),
            None => Ok(()),
        }
    }

    /// Blocks until the task has finished, ignoring any failure of its body.
    pub fn wait_until_done_ignoring_exceptions(&self) {
        self.done.wait();
    }

    /// Current state of the task.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// The failure recorded by the task body, once finished.
    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.get()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("failure", &self.failure.get())
            .finish_non_exhaustive()
    }
}
