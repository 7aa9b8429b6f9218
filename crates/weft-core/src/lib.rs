//! weft-core
//!
//! Core building blocks for Weft flows.
//!
//! # Modules
//! - **domain**: data model (ids, payload, envelope, graph spec)
//! - **registry**: `Handler` trait, handler registry and the directory of compiled flows
//! - **graph**: compiles a `GraphSpec` into a `Flow` and executes it
//! - **queue**: retryable tasks and the in-process queue that drives them
//! - **ports**: clock abstraction
//! - **error**: error types

pub mod domain;
pub mod error;
pub mod graph;
pub mod ports;
pub mod queue;
pub mod registry;

pub use domain::{Branch, Envelope, GraphSpec, Payload, RequestId, TaskId};
pub use error::{FlowError, QueueError, TaskError};
pub use graph::Flow;
pub use queue::{Queue, QueueConfig, RetryPolicy, Task, TaskState};
pub use registry::{FlowDirectory, Handler, HandlerRegistry, handler_fn};
