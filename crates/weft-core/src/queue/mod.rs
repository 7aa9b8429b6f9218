//! Retryable tasks and the queue that drives them.

mod dispatcher;
mod retry;
mod state;
mod task;

pub use dispatcher::{Queue, QueueConfig, join};
pub use retry::{Backoff, MaxAttempts, RetryPolicy};
pub use state::TaskState;
pub use task::Task;
