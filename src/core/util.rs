// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// No user code ever runs while the mutex is held, so a poisoned mutex can only
/// result from a panic in this crate's own bookkeeping. Waiters recover the
/// guard rather than propagating the poison.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes up all the threads waiting on this status.
    pub fn wake_all(&self) {
        self.condvar.notify_all();
    }

    /// Runs the given function on the status and notifies all waiting threads.
    pub fn update_and_notify_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.lock(), predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the predicate is false on this status, or until the timeout
    /// elapses.
    ///
    /// This returns a [`MutexGuard`] as well as whether the timeout elapsed
    /// while the predicate was still true.
    pub fn wait_timeout_while(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, bool) {
        let (guard, result) = self
            .condvar
            .wait_timeout_while(self.lock(), timeout, predicate)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }
}
