//! Error types: the reified user exception that travels with a failed
//! task, and the core's own failure modes.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// A user exception captured inside a task body.
///
/// Exceptions are reified so they can cross worker boundaries: the
/// executing worker stores one into the task, the owning worker
/// re-raises it from the first `result()` that observes it. Equality
/// is structural so fidelity can be asserted end to end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError { kind: kind.into(), message: message.into(), payload: None }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Infrastructure-level failure surfaced to a task body.
    pub fn runtime(message: impl Into<String>) -> Self {
        TaskError::new("runtime", message)
    }

    /// Captures a panic payload from `catch_unwind`.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        TaskError::new("panic", message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

/// Failure modes of the core itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no task function registered under {0:?}")]
    UnknownCallable(String),

    #[error("the pool was not started properly; run your program through startup()")]
    NotStarted,

    #[error("configuration: {0}")]
    Config(String),

    #[error("identity handshake failed: {0}")]
    Handshake(String),

    #[error("the broker shut down")]
    Shutdown,

    #[error("no runnable futures left and no broker to pull from")]
    Deadlock,

    #[error("root task failed: {0}")]
    Task(TaskError),
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        match err {
            Error::Task(inner) => inner,
            Error::UnknownCallable(name) => {
                TaskError::new("unknown-callable", format!("no task function named {name:?}"))
            }
            Error::Shutdown => TaskError::new("shutdown", "the broker shut down"),
            other => TaskError::runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_keep_their_message() {
        let err = TaskError::from_panic(Box::new("boom"));
        assert_eq!(err, TaskError::new("panic", "boom"));
        let err = TaskError::from_panic(Box::new(format!("boom {}", 2)));
        assert_eq!(err.message, "boom 2");
    }

    #[test]
    fn core_errors_downgrade_to_task_errors() {
        let err: TaskError = Error::UnknownCallable("nope".into()).into();
        assert_eq!(err.kind, "unknown-callable");
        let err: TaskError = Error::Shutdown.into();
        assert_eq!(err.kind, "shutdown");
    }
}
