//! GraphSpec -> Flow.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::vertex::{BranchTable, Vertex, VertexKind};
use super::{Flow, Graph};
use crate::domain::GraphSpec;
use crate::error::FlowError;
use crate::registry::{Handler, HandlerRegistry};

impl Flow {
    /// Compile `spec` against `registry` and publish the result in the
    /// registry's flow directory under `name`.
    ///
    /// # Entry vertex
    /// Unless `first_node` is set, the entry is inferred from the edges in
    /// declaration order: every edge source that has never been a target (of
    /// an edge, a branch condition or a loop) becomes the candidate, and the
    /// last candidate wins. With several disconnected source chains only the
    /// last declared one is reachable from `process`; declare `first_node`
    /// for multi-root graphs.
    pub fn build(
        name: impl Into<String>,
        spec: &GraphSpec,
        registry: &HandlerRegistry,
    ) -> Result<Flow, FlowError> {
        let name = name.into();
        let graph = Compiler::new(registry).compile(name.clone(), spec)?;
        let flow = Flow {
            graph: Arc::new(graph),
        };
        info!(
            flow = %name,
            vertices = flow.len(),
            entry = ?flow.entry(),
            "flow compiled"
        );
        if registry.flows().insert(flow.clone()).is_some() {
            debug!(flow = %name, "replaced previously compiled flow");
        }
        Ok(flow)
    }

    /// Parse the wire format and compile it.
    pub fn from_json(
        name: impl Into<String>,
        raw: &[u8],
        registry: &HandlerRegistry,
    ) -> Result<Flow, FlowError> {
        let spec = GraphSpec::from_json(raw)?;
        Self::build(name, &spec, registry)
    }
}

struct Compiler<'r> {
    registry: &'r HandlerRegistry,
    vertices: HashMap<String, Vertex>,
    /// Seen as an edge target, branch target or loop child.
    out_role: HashSet<String>,
    entry: Option<String>,
}

impl<'r> Compiler<'r> {
    fn new(registry: &'r HandlerRegistry) -> Self {
        Self {
            registry,
            vertices: HashMap::new(),
            out_role: HashSet::new(),
            entry: None,
        }
    }

    fn compile(mut self, name: String, spec: &GraphSpec) -> Result<Graph, FlowError> {
        for node in &spec.nodes {
            self.require_vertex(node)?;
        }

        // Branch targets and bare edge endpoints are optional: no handler, no
        // vertex. Edges to them fail below.
        for branch in &spec.branches {
            if self.registry.contains(&branch.key) {
                for target in branch.conditional_nodes.values() {
                    self.optional_vertex(target);
                }
            }
        }
        for (source, target) in &spec.edges {
            self.optional_vertex(source);
            self.optional_vertex(target);
        }

        for decl in &spec.loops {
            self.compile_loop(decl)?;
        }

        for branch in &spec.branches {
            let handler = self
                .registry
                .get(&branch.key)
                .ok_or_else(|| FlowError::MissingBranchHandler(branch.key.clone()))?;
            self.compile_branch(&branch.key, handler, &branch.conditional_nodes);
        }

        for (source, target) in &spec.edges {
            self.connect(source, target)?;
        }

        if spec.edges.is_empty() && self.vertices.is_empty() {
            return Err(FlowError::EmptyGraph);
        }

        let entry = match &spec.first_node {
            Some(first) => Some(self.existing(first)?),
            None => self.entry.take(),
        };
        let exit = spec
            .last_node
            .as_deref()
            .map(|last| self.existing(last))
            .transpose()?;

        Ok(Graph {
            name,
            vertices: self.vertices,
            entry,
            exit,
        })
    }

    fn existing(&self, name: &str) -> Result<String, FlowError> {
        if self.vertices.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(FlowError::VertexNotFound(name.to_string()))
        }
    }

    fn require_vertex(&mut self, name: &str) -> Result<(), FlowError> {
        if self.vertices.contains_key(name) {
            return Ok(());
        }
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| FlowError::MissingHandler(name.to_string()))?;
        self.vertices
            .insert(name.to_string(), Vertex::plain(name, handler));
        Ok(())
    }

    fn optional_vertex(&mut self, name: &str) {
        if self.vertices.contains_key(name) {
            return;
        }
        match self.registry.get(name) {
            Some(handler) => {
                self.vertices
                    .insert(name.to_string(), Vertex::plain(name, handler));
            }
            None => debug!(vertex = name, "no handler; vertex skipped"),
        }
    }

    fn compile_loop(&mut self, decl: &[String]) -> Result<(), FlowError> {
        let Some((driver, children)) = decl.split_first() else {
            return Err(FlowError::InvalidSpec("empty loop declaration".to_string()));
        };
        if children.is_empty() {
            return Err(FlowError::InvalidSpec(format!(
                "loop '{driver}' declares no children"
            )));
        }
        for child in children {
            self.require_vertex(child)?;
            self.out_role.insert(child.clone());
        }
        self.require_vertex(driver)?;
        if let Some(vertex) = self.vertices.get_mut(driver.as_str()) {
            vertex.kind = VertexKind::Loop {
                children: children.to_vec(),
            };
        }
        Ok(())
    }

    fn compile_branch(
        &mut self,
        key: &str,
        handler: Arc<dyn Handler>,
        conditions: &BTreeMap<String, String>,
    ) {
        let mut routes = BTreeMap::new();
        for (status, target) in conditions {
            self.out_role.insert(target.clone());
            if self.vertices.contains_key(target) {
                routes.insert(status.clone(), target.clone());
            } else {
                debug!(branch = key, status = %status, target = %target, "branch target not compiled; route omitted");
            }
        }
        let table = BranchTable::new(conditions.len(), routes);

        let vertex = self
            .vertices
            .entry(key.to_string())
            .or_insert_with(|| Vertex::plain(key, handler));
        if let VertexKind::Branch(existing) = &mut vertex.kind {
            existing.extend(table);
            return;
        }
        if matches!(vertex.kind, VertexKind::Loop { .. }) {
            warn!(vertex = key, "loop vertex redeclared as branch; loop children dropped");
        }
        vertex.kind = VertexKind::Branch(table);
    }

    fn connect(&mut self, source: &str, target: &str) -> Result<(), FlowError> {
        if !self.vertices.contains_key(source) {
            return Err(FlowError::VertexNotFound(source.to_string()));
        }
        if !self.vertices.contains_key(target) {
            return Err(FlowError::VertexNotFound(target.to_string()));
        }

        self.out_role.insert(target.to_string());
        // `source` is in its in-role now; it qualifies while it has never
        // been anybody's target.
        if !self.out_role.contains(source) {
            self.entry = Some(source.to_string());
        }

        if let Some(vertex) = self.vertices.get_mut(source) {
            vertex.add_successor(target);
        }
        Ok(())
    }
}
