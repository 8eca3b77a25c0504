use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

use crate::{
    connection::Connection,
    identity::{Direction, PointMeta, PortId},
    node::{NodeKind, NodeRef},
    storage::{Storage, StorageError},
};

pub const LINKS_KEY: &str = "nodeboard.graph.links";
pub const NODES_KEY: &str = "nodeboard.graph.nodes";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("could not encode board state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// A persisted edge, expressed with side labels rather than port ids so it
/// survives ports being re-registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub from_kind: NodeKind,
    pub from_id: String,
    pub from_side: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub from_index: u32,
    pub to_kind: NodeKind,
    pub to_id: String,
    pub to_side: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub to_index: u32,
}

impl EdgeRecord {
    pub fn from_points(from: &PointMeta, to: &PointMeta) -> Self {
        Self {
            from_kind: from.node.kind,
            from_id: from.node.id.clone(),
            from_side: from.side.clone(),
            from_index: from.index,
            to_kind: to.node.kind,
            to_id: to.node.id.clone(),
            to_side: to.side.clone(),
            to_index: to.index,
        }
    }

    /// Builds the record for a live connection from its port ids.
    pub fn of(connection: &Connection) -> Option<Self> {
        let from = PortId::parse(connection.source.as_str()).ok()?;
        let to = PortId::parse(connection.sink.as_str()).ok()?;
        Some(Self::from_points(&from, &to))
    }

    pub fn from_point(&self) -> PointMeta {
        PointMeta::new(NodeRef::new(self.from_kind, &self.from_id), &self.from_side, self.from_index)
    }

    pub fn to_point(&self) -> PointMeta {
        PointMeta::new(NodeRef::new(self.to_kind, &self.to_id), &self.to_side, self.to_index)
    }

    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}:{}->{}:{}:{}:{}",
            self.from_kind, self.from_id, self.from_side, self.from_index,
            self.to_kind, self.to_id, self.to_side, self.to_index
        )
    }

    pub fn touches(&self, node: &NodeRef) -> bool {
        (self.from_kind == node.kind && self.from_id == node.id)
            || (self.to_kind == node.kind && self.to_id == node.id)
    }
}

/// A persisted node and the sides it exposes ports on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub id: String,
    #[serde(default)]
    pub sides: Vec<String>,
}

impl NodeRecord {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.kind, &self.id)
    }
}

/// Everything needed to rebuild a board, in one document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub nodes: Vec<NodeRecord>,
    pub links: Vec<EdgeRecord>,
    pub directions: BTreeMap<String, Direction>,
}

/// Edge and node lists kept in storage as JSON arrays.
///
/// Reads are forgiving: unreadable data is logged and treated as empty,
/// so a damaged entry never blocks the board from loading.
#[derive(Debug, Clone)]
pub struct GraphPersistence {
    storage: Storage,
}

impl GraphPersistence {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        let Some(raw) = self.storage.get_item(key) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(key, error = %err, "discarding unreadable board data");
            Vec::new()
        })
    }

    fn write<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), PersistenceError> {
        let raw = serde_json::to_string(items)?;
        self.storage.set_item(key, &raw)?;
        Ok(())
    }

    pub fn load_all(&self) -> Vec<EdgeRecord> {
        self.read(LINKS_KEY)
    }

    /// Appends `record` unless an edge with the same signature is stored.
    pub fn add_edge(&self, record: EdgeRecord) -> Result<bool, PersistenceError> {
        let mut links = self.load_all();
        let signature = record.signature();
        if links.iter().any(|l| l.signature() == signature) {
            return Ok(false);
        }
        links.push(record);
        self.write(LINKS_KEY, &links)?;
        Ok(true)
    }

    /// Drops every stored edge matching `predicate`; returns how many.
    pub fn remove_where(&self, predicate: impl Fn(&EdgeRecord) -> bool) -> Result<usize, PersistenceError> {
        let links = self.load_all();
        let before = links.len();
        let kept: Vec<EdgeRecord> = links.into_iter().filter(|l| !predicate(l)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write(LINKS_KEY, &kept)?;
        }
        Ok(removed)
    }

    pub fn load_nodes(&self) -> Vec<NodeRecord> {
        let mut seen = HashSet::new();
        self.read::<NodeRecord>(NODES_KEY)
            .into_iter()
            .filter(|n| seen.insert(n.node_ref()))
            .collect()
    }

    pub fn add_node(&self, record: NodeRecord) -> Result<(), PersistenceError> {
        let mut nodes = self.load_nodes();
        match nodes.iter_mut().find(|n| n.node_ref() == record.node_ref()) {
            Some(existing) => *existing = record,
            None => nodes.push(record),
        }
        self.write(NODES_KEY, &nodes)
    }

    /// Removes the node record and every edge touching it.
    pub fn remove_node(&self, node: &NodeRef) -> Result<usize, PersistenceError> {
        let nodes: Vec<NodeRecord> = self
            .load_nodes()
            .into_iter()
            .filter(|n| &n.node_ref() != node)
            .collect();
        self.write(NODES_KEY, &nodes)?;
        self.remove_where(|l| l.touches(node))
    }

    pub fn snapshot(&self, directions: BTreeMap<String, Direction>) -> BoardSnapshot {
        BoardSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            nodes: self.load_nodes(),
            links: self.load_all(),
            directions,
        }
    }

    /// Replaces stored nodes and edges with the snapshot's content.
    pub fn import(&self, snapshot: &BoardSnapshot) -> Result<(), PersistenceError> {
        self.write(NODES_KEY, &snapshot.nodes)?;
        let mut seen = HashSet::new();
        let links: Vec<&EdgeRecord> = snapshot
            .links
            .iter()
            .filter(|l| seen.insert(l.signature()))
            .collect();
        self.write(LINKS_KEY, &links)
    }
}
