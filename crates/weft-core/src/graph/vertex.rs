//! Vertex model and the per-vertex execution step.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Graph;
use super::fanout;
use crate::domain::{Envelope, Payload};
use crate::error::{FlowError, panic_message};
use crate::registry::Handler;

/// Status -> successor table of a branch vertex.
///
/// `declared` counts every condition of the `GraphSpec`, `routes` keeps only
/// the ones whose target compiled into a vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchTable {
    declared: usize,
    routes: BTreeMap<String, String>,
}

impl BranchTable {
    pub(crate) fn new(declared: usize, routes: BTreeMap<String, String>) -> Self {
        Self { declared, routes }
    }

    pub(crate) fn extend(&mut self, other: BranchTable) {
        self.declared += other.declared;
        self.routes.extend(other.routes);
    }

    /// Successor for `status`, if any. Exact match only.
    pub fn route(&self, status: &str) -> Option<&str> {
        self.routes.get(status).map(String::as_str)
    }

    pub fn routes(&self) -> &BTreeMap<String, String> {
        &self.routes
    }

    /// No conditions declared at all.
    pub fn is_empty(&self) -> bool {
        self.declared == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertexKind {
    Plain,
    Branch(BranchTable),
    /// Children run per element of the driver's output, in this order.
    Loop { children: Vec<String> },
}

/// A compiled, executable node.
pub struct Vertex {
    pub(crate) name: String,
    pub(crate) kind: VertexKind,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) successors: Vec<String>,
}

impl Vertex {
    pub(crate) fn plain(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            kind: VertexKind::Plain,
            handler,
            successors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &VertexKind {
        &self.kind
    }

    /// Successors in registration order; each consumes the previous one's
    /// output.
    pub fn successors(&self) -> &[String] {
        &self.successors
    }

    pub(crate) fn add_successor(&mut self, target: &str) {
        if !self.successors.iter().any(|s| s == target) {
            self.successors.push(target.to_string());
        }
    }

    /// Invoke the handler. A panic is the one thing that must not unwind past
    /// here.
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        envelope: Envelope,
    ) -> Result<Envelope, FlowError> {
        match AssertUnwindSafe(self.handler.handle(ctx, envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(vertex = %self.name, %message, "handler panicked");
                Err(FlowError::HandlerPanicked {
                    vertex: self.name.clone(),
                    message,
                })
            }
        }
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("successors", &self.successors)
            .finish_non_exhaustive()
    }
}

/// Result of running a vertex and everything routed from it.
pub(crate) enum Step {
    /// Routing finished normally; the caller carries on with its own
    /// successors.
    Continue(Envelope),
    /// The exit vertex was reached somewhere below; every caller up to
    /// `Flow::process` returns straight away.
    Exit(Envelope),
}

impl Step {
    pub(crate) fn into_envelope(self) -> Envelope {
        match self {
            Step::Continue(envelope) | Step::Exit(envelope) => envelope,
        }
    }
}

impl Graph {
    /// Execute vertex `name` and everything routed from it.
    ///
    /// `path` holds the vertices on the current call stack; meeting one of
    /// them again means the graph loops back on itself.
    pub(crate) fn run_vertex<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
        ctx: &'a CancellationToken,
        mut envelope: Envelope,
        path: &'a [String],
    ) -> BoxFuture<'a, Result<Step, FlowError>> {
        async move {
            if path.iter().any(|seen| seen == name) {
                let mut cycle = path.to_vec();
                cycle.push(name.to_string());
                return Err(FlowError::CycleDetected(cycle));
            }
            if ctx.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let vertex = self
                .vertices
                .get(name)
                .ok_or_else(|| FlowError::VertexNotFound(name.to_string()))?;

            if let VertexKind::Branch(table) = &vertex.kind
                && table.is_empty()
            {
                return Err(FlowError::EmptyBranch(name.to_string()));
            }

            let mut path = path.to_vec();
            path.push(name.to_string());

            envelope.current_vertex = name.to_string();
            debug!(flow = %self.name, vertex = name, "vertex entered");

            let mut response = match &vertex.kind {
                VertexKind::Loop { children } => {
                    let input = envelope.clone();
                    let mut response = vertex.invoke(ctx, envelope).await?;
                    let items = response
                        .payload
                        .as_collection()
                        .ok_or_else(|| FlowError::NotACollection(name.to_string()))?;
                    let merged = fanout::run(self, children, ctx, &input, items, &path).await?;
                    response.payload = Payload::Json(Value::Array(merged));
                    response
                }
                _ => vertex.invoke(ctx, envelope).await?,
            };

            if self.exit.as_deref() == Some(name) {
                debug!(flow = %self.name, vertex = name, "exit vertex reached");
                return Ok(Step::Exit(response));
            }

            if let VertexKind::Branch(table) = &vertex.kind
                && let Some(target) = table.route(&response.status)
            {
                debug!(vertex = name, status = %response.status, target, "branch taken");
                match self.run_vertex(target, ctx, response, &path).await? {
                    Step::Continue(next) => response = next,
                    exit @ Step::Exit(_) => return Ok(exit),
                }
            }

            for successor in &vertex.successors {
                match self.run_vertex(successor, ctx, response, &path).await? {
                    Step::Continue(next) => response = next,
                    exit @ Step::Exit(_) => return Ok(exit),
                }
            }

            Ok(Step::Continue(response))
        }
        .boxed()
    }
}
