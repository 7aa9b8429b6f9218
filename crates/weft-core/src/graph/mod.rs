//! Compiled flows.
//!
//! `Flow::build` turns a `GraphSpec` into a linked graph of vertices
//! (`compiler`), `Flow::process` walks it (`vertex`), and loop vertices fan
//! their collection out over concurrent workers (`fanout`).

mod compiler;
mod fanout;
mod vertex;


pub use vertex::{BranchTable, Vertex, VertexKind};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::Envelope;
use crate::error::FlowError;
use crate::registry::Handler;

/// Vertices plus entry/exit, shared between clones of a `Flow` and the loop
/// workers spawned while it runs.
pub(crate) struct Graph {
    name: String,
    vertices: HashMap<String, Vertex>,
    entry: Option<String>,
    exit: Option<String>,
}

/// A compiled, immutable graph. Cloning is cheap.
#[derive(Clone)]
pub struct Flow {
    graph: Arc<Graph>,
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.graph.name
    }

    /// Vertex `process` starts from.
    pub fn entry(&self) -> Option<&str> {
        self.graph.entry.as_deref()
    }

    /// Vertex after which traversal stops, when one was declared.
    pub fn exit(&self) -> Option<&str> {
        self.graph.exit.as_deref()
    }

    pub fn vertex(&self, name: &str) -> Option<&Vertex> {
        self.graph.vertices.get(name)
    }

    /// Vertex names, sorted.
    pub fn vertex_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.graph.vertices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.graph.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.vertices.is_empty()
    }

    /// Run `envelope` through the flow from its entry vertex.
    ///
    /// Returns the envelope produced by the last vertex reached, or the first
    /// error raised anywhere in the traversal.
    pub async fn process(
        &self,
        ctx: &CancellationToken,
        envelope: Envelope,
    ) -> Result<Envelope, FlowError> {
        let entry = self
            .graph
            .entry
            .as_deref()
            .ok_or_else(|| FlowError::NoEntryVertex(self.graph.name.clone()))?;
        debug!(flow = %self.graph.name, entry, request_id = ?envelope.request_id, "processing");
        self.graph
            .run_vertex(entry, ctx, envelope, &[])
            .await
            .map(vertex::Step::into_envelope)
    }
}

/// A compiled flow can itself be registered as a node of another flow.
#[async_trait]
impl Handler for Flow {
    async fn handle(
        &self,
        ctx: &CancellationToken,
        envelope: Envelope,
    ) -> Result<Envelope, FlowError> {
        self.process(ctx, envelope).await
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.graph.name)
            .field("entry", &self.graph.entry)
            .field("exit", &self.graph.exit)
            .field("vertices", &self.vertex_names())
            .finish()
    }
}
