// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Capture of failures escaping background work, for deterministic rethrow at
//! a later join point.

use crate::error::{BoxError, Error, Result, TaskFailure};
use crate::macros::{log_debug, log_error};
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

/// Runs the given function, capturing both a returned error and a panic as a
/// [`TaskFailure`].
pub fn catch_failure<T>(
    f: impl FnOnce() -> std::result::Result<T, BoxError>,
) -> std::result::Result<T, TaskFailure> {
    // The failure is recorded and surfaced to the caller instead of resuming the
    // unwind, so any state observed in an inconsistent state by `f` is only ever
    // handed back together with the failure.
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(t)) => Ok(t),
        Ok(Err(e)) => Err(TaskFailure::from(e)),
        Err(payload) => Err(TaskFailure::from_panic(payload)),
    }
}

/// A dedicated thread whose failure (returned error or panic) is captured and
/// re-raised by [`join()`](Self::join).
pub struct CatchingThread<T> {
    name: String,
    handle: JoinHandle<std::result::Result<T, TaskFailure>>,
}

impl<T: Send + 'static> CatchingThread<T> {
    /// Spawns a named thread running the given function.
    pub fn spawn(
        name: impl Into<String>,
        f: impl FnOnce() -> std::result::Result<T, BoxError> + Send + 'static,
    ) -> Result<Self> {
        let name = name.into();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn({
                let _name = name.clone();
                move || {
                    let result = catch_failure(f);
                    if let Err(_e) = &result {
                        log_error!("[thread {_name}] Captured failure: {_e}");
                    }
                    result
                }
            })
            .map_err(Error::Spawn)?;
        log_debug!("Spawned catching thread {name}");
        Ok(Self { name, handle })
    }
}

impl<T> CatchingThread<T> {
    /// Name of the thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread has finished running.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the thread to finish, and re-raises its failure if any.
    pub fn join(self) -> Result<T> {
        match self.handle.join() {
            Ok(result) => result.map_err(Error::from),
            // Only reachable if the capture itself panicked, e.g. when dropping a
            // panic payload panics.
            Err(payload) => Err(Error::ThreadPanicked(
                match TaskFailure::from_panic(payload) {
                    TaskFailure::Panic(message) => message,
                    other => other.to_string(),
                },
            )),
        }
    }
}
