// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use super::util::Status;
use std::time::Duration;

/// Status of a [`Latch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LatchStatus {
    /// Waiters are blocked.
    Closed,
    /// The latch has been released, waiters proceed.
    Open,
}

/// A one-shot latch: threads block in [`wait()`](Self::wait) until some thread
/// calls [`release()`](Self::release). Once released, the latch stays open.
pub struct Latch {
    status: Status<LatchStatus>,
}

impl Latch {
    /// Creates a closed latch.
    pub fn new() -> Self {
        Self {
            status: Status::new(LatchStatus::Closed),
        }
    }

    /// Opens the latch and wakes up all the waiters.
    ///
    /// Returns `true` if this call released the latch, and `false` if it was
    /// already open.
    pub fn release(&self) -> bool {
        self.status
            .update_and_notify_all(|status| std::mem::replace(status, LatchStatus::Open))
            == LatchStatus::Closed
    }

    /// Returns whether the latch has been released.
    pub fn is_released(&self) -> bool {
        *self.status.lock() == LatchStatus::Open
    }

    /// Blocks until the latch is released.
    pub fn wait(&self) {
        let _guard = self
            .status
            .wait_while(|status| *status == LatchStatus::Closed);
    }

    /// Blocks until the latch is released or the timeout elapses. Returns
    /// whether the latch has been released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (_guard, timed_out) = self
            .status
            .wait_timeout_while(timeout, |status| *status == LatchStatus::Closed);
        !timed_out
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
