use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::identity::{Direction, PortId};

/// What sits behind a node on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// LLM-backed participant that answers every inbound payload.
    Agent,
    /// Human chat endpoint.
    Human,
    /// Capability endpoint (e.g. web access). Never consumes payloads.
    SinkHub,
    /// Section of a document that accumulates appended text.
    #[serde(rename = "document-section")]
    Section,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "agent",
            NodeKind::Human => "human",
            NodeKind::SinkHub => "sink-hub",
            NodeKind::Section => "document-section",
        }
    }

    /// Direction a freshly registered port of this kind starts with.
    pub fn default_direction(&self) -> Direction {
        match self {
            NodeKind::SinkHub => Direction::Sink,
            _ => Direction::Source,
        }
    }

    /// Whether ports of this kind may change direction after registration.
    pub fn has_fixed_direction(&self) -> bool {
        matches!(self, NodeKind::SinkHub)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(NodeKind::Agent),
            "human" => Ok(NodeKind::Human),
            "sink-hub" => Ok(NodeKind::SinkHub),
            "document-section" => Ok(NodeKind::Section),
            other => Err(format!("unknown node kind `{other}`")),
        }
    }
}

/// Identity of a node: unique per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub id: String,
}

impl NodeRef {
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Agent, id)
    }

    pub fn human(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Human, id)
    }

    pub fn hub(id: impl Into<String>) -> Self {
        Self::new(NodeKind::SinkHub, id)
    }

    pub fn section(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Section, id)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Parses `kind:id`, as printed by `Display`.
impl FromStr for NodeRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected `kind:id`, got `{s}`"))?;
        if id.is_empty() || id.contains(':') {
            return Err(format!("invalid node id in `{s}`"));
        }
        Ok(NodeRef::new(kind.parse()?, id))
    }
}

/// A node on the board together with the ports it exposes on each side.
#[derive(Debug, Clone)]
pub struct Node {
    node: NodeRef,
    ports: BTreeMap<String, Vec<PortId>>,
    created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(node: NodeRef) -> Self {
        Self {
            node,
            ports: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn node_ref(&self) -> &NodeRef {
        &self.node
    }

    pub fn kind(&self) -> NodeKind {
        self.node.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Index the next port on `side` will get.
    pub fn next_index(&self, side: &str) -> u32 {
        self.ports.get(side).map(|p| p.len() as u32).unwrap_or(0)
    }

    pub fn attach(&mut self, side: &str, port: PortId) {
        let ports = self.ports.entry(side.to_string()).or_default();
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    pub fn sides(&self) -> Vec<String> {
        self.ports.keys().cloned().collect()
    }

    pub fn ports_on(&self, side: &str) -> &[PortId] {
        self.ports.get(side).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortId> {
        self.ports.values().flatten()
    }
}
