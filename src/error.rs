// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types surfaced at the join points of parallel executions.

use std::any::Any;
use std::sync::Arc;

/// A boxed error returned by task bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type of the blocking operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure captured from a task body or a background thread.
///
/// This type is cheap to clone, so that the same cause can be recorded both by
/// the task that observed it and by the factory that owns the task.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TaskFailure {
    /// The task body returned an error.
    #[error("task returned an error: {0}")]
    Error(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// The task body panicked with the given message.
    #[error("task panicked: {0}")]
    Panic(String),
}

impl TaskFailure {
    /// Converts the payload of a caught panic into a failure, extracting the
    /// panic message when it is a string.
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "<non-string panic payload>".to_owned(),
            },
        };
        TaskFailure::Panic(message)
    }

    /// Returns whether this failure originates from a panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, TaskFailure::Panic(_))
    }
}

impl From<BoxError> for TaskFailure {
    fn from(error: BoxError) -> Self {
        TaskFailure::Error(Arc::from(error))
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task (or background work) failed. The original cause is available as
    /// the error source.
    #[error("parallel execution failed")]
    TaskFailed {
        /// The first failure observed during the execution.
        #[source]
        cause: TaskFailure,
    },
    /// Work was submitted to a worker pool that has been shut down.
    #[error("the worker pool has been shut down")]
    PoolShutdown,
    /// A dedicated thread terminated abnormally outside of the failure-capturing
    /// wrapper.
    #[error("thread panicked: {0}")]
    ThreadPanicked(String),
    /// The operating system refused to spawn a thread.
    #[error("failed to spawn a thread")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    /// Returns the captured task failure, if this error wraps one.
    pub fn cause(&self) -> Option<&TaskFailure> {
        match self {
            Error::TaskFailed { cause } => Some(cause),
            _ => None,
        }
    }
}

impl From<TaskFailure> for Error {
    fn from(cause: TaskFailure) -> Self {
        Error::TaskFailed { cause }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_failure_from_panic_payload() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 42)).unwrap_err();
        match TaskFailure::from_panic(payload) {
            TaskFailure::Panic(message) => assert_eq!(message, "boom 42"),
            other => panic!("unexpected failure: {other:?}"),
        }

        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert!(matches!(
            TaskFailure::from_panic(payload),
            TaskFailure::Panic(message) if message == "static"
        ));

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(17u8)).unwrap_err();
        assert!(TaskFailure::from_panic(payload).is_panic());
    }

    #[test]
    fn test_task_failed_references_cause() {
        let boxed: BoxError = "disk on fire".into();
        let error = Error::from(TaskFailure::from(boxed));
        assert_eq!(error.to_string(), "parallel execution failed");
        let source = error.source().expect("the cause must be the error source");
        assert_eq!(source.to_string(), "task returned an error: disk on fire");
        assert!(!error.cause().unwrap().is_panic());
    }
}
