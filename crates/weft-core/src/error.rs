use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while compiling or executing a flow.
///
/// Compilation variants come out of `Flow::build`; everything else aborts a
/// single `Flow::process` call. Nothing in the graph engine retries: wrap the
/// call in a queue task if you want that.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("invalid graph spec: {0}")]
    InvalidSpec(String),

    #[error("no handler registered for node '{0}'")]
    MissingHandler(String),

    #[error("no branch handler for key '{0}'")]
    MissingBranchHandler(String),

    #[error("vertex '{0}' doesn't exist")]
    VertexNotFound(String),

    #[error("no vertex or edges are defined")]
    EmptyGraph,

    #[error("flow '{0}' has no entry vertex")]
    NoEntryVertex(String),

    #[error("branch vertex '{0}' requires at least one condition")]
    EmptyBranch(String),

    #[error("payload of loop vertex '{0}' is not a collection")]
    NotACollection(String),

    #[error("payload encoding: {0}")]
    Payload(String),

    #[error("{0}")]
    Handler(String),

    #[error("handler for vertex '{vertex}' panicked: {message}")]
    HandlerPanicked { vertex: String, message: String },

    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("execution cancelled")]
    Cancelled,

    #[error("loop worker failed: {0}")]
    Join(String),
}

impl FlowError {
    /// Shorthand for handlers reporting their own failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

/// Outcome of a task attempt that did not succeed.
///
/// `DoNotReattempt` and `MaxAttemptsExceeded` are terminal. Every other
/// variant schedules another attempt while attempts remain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("this task was already successfully completed once")]
    AlreadyComplete,

    #[error("this task should not be re-attempted: {0}")]
    DoNotReattempt(String),

    #[error("the maximum attempts for this task has been exceeded ({attempts}); last error: {last}")]
    MaxAttemptsExceeded { attempts: u32, last: String },

    #[error("{0}")]
    Failed(String),

    #[error("panic: {0}")]
    Panicked(String),

    #[error("attempt exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn do_not_reattempt(message: impl Into<String>) -> Self {
        Self::DoNotReattempt(message.into())
    }

    /// Terminal errors end the task without consuming further attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskError::DoNotReattempt(_) | TaskError::MaxAttemptsExceeded { .. }
        )
    }
}

impl From<FlowError> for TaskError {
    fn from(err: FlowError) -> Self {
        Self::Failed(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue '{0}' is shutting down; new tasks are not being accepted")]
    ShuttingDown(String),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
