//! Domain model: ids, payloads, envelopes and graph specs.

pub mod envelope;
pub mod ids;
pub mod payload;
pub mod spec;

pub use envelope::Envelope;
pub use ids::{RequestId, TaskId};
pub use payload::Payload;
pub use spec::{Branch, GraphSpec};
