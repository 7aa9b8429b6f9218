//! Declarative graph description.
//!
//! A `GraphSpec` is either deserialized from the wire format or assembled
//! with the builder methods below. Nothing is validated here; `Flow::build`
//! does that against a handler registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Conditional routing declared for one vertex: status -> target vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub key: String,
    #[serde(default)]
    pub conditional_nodes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    /// `[source, target]` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<(String, String)>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,

    /// `[driver, child, ...]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loops: Vec<Vec<String>>,

    /// Explicit entry vertex; bypasses inference when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_node: Option<String>,

    /// Explicit exit vertex; traversal stops after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node: Option<String>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, FlowError> {
        serde_json::from_slice(bytes).map_err(|e| FlowError::InvalidSpec(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self, FlowError> {
        Self::from_json(s.as_bytes())
    }

    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.nodes.push(name.into());
        self
    }

    pub fn edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push((source.into(), target.into()));
        self
    }

    pub fn conditional<K, V>(
        mut self,
        vertex: impl Into<String>,
        conditions: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.branches.push(Branch {
            key: vertex.into(),
            conditional_nodes: conditions
                .into_iter()
                .map(|(status, target)| (status.into(), target.into()))
                .collect(),
        });
        self
    }

    pub fn loop_over<I, S>(mut self, driver: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut decl = vec![driver.into()];
        decl.extend(children.into_iter().map(Into::into));
        self.loops.push(decl);
        self
    }

    pub fn first_node(mut self, name: impl Into<String>) -> Self {
        self.first_node = Some(name.into());
        self
    }

    pub fn last_node(mut self, name: impl Into<String>) -> Self {
        self.last_node = Some(name.into());
        self
    }
}
