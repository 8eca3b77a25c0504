use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId},
    factory::{ConnectionFactory, Rejected},
    graph::{ConnectionGraph, EdgeDirection, Neighbor},
    identity::{Direction, DirectionListener, IdentityError, IdentityRegistry, PointMeta, PortId},
    message::Message,
    node::{Node, NodeKind, NodeRef},
    observer::{ConnectionObserver, Observers},
    persistence::{BoardSnapshot, EdgeRecord, GraphPersistence, NodeRecord, PersistenceError},
    port::Port,
    storage::Storage,
};

pub type SharedBoard = Arc<RwLock<Board>>;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("node {0} is already on the board")]
    NodeExists(NodeRef),
    #[error("node {0} is not on the board")]
    UnknownNode(NodeRef),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("port {0} has live connections")]
    PortPinned(PortId),
    #[error("port {0} has a fixed direction")]
    FixedDirection(PortId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub nodes: usize,
    pub links: usize,
    pub dropped: usize,
}

/// Owns every piece of graph state and is the only place that mutates it.
///
/// Connections are created through the factory, written through to storage
/// and announced to observers, in that order.
#[derive(Debug)]
pub struct Board {
    registry: IdentityRegistry,
    graph: ConnectionGraph,
    factory: ConnectionFactory,
    nodes: BTreeMap<NodeRef, Node>,
    persistence: GraphPersistence,
    observers: Observers,
}

impl Board {
    pub fn new(storage: Storage) -> Self {
        Self {
            registry: IdentityRegistry::new(storage.clone()),
            graph: ConnectionGraph::new(),
            factory: ConnectionFactory::new(),
            nodes: BTreeMap::new(),
            persistence: GraphPersistence::new(storage),
            observers: Observers::default(),
        }
    }

    pub fn shared(self) -> SharedBoard {
        Arc::new(RwLock::new(self))
    }

    pub fn graph(&self) -> &ConnectionGraph {
        &self.graph
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn persistence(&self) -> &GraphPersistence {
        &self.persistence
    }

    pub fn subscribe(&mut self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn on_direction_change(&mut self, listener: DirectionListener) {
        self.registry.on_direction_change(listener);
    }

    pub fn node(&self, node: &NodeRef) -> Option<&Node> {
        self.nodes.get(node)
    }

    pub fn contains_node(&self, node: &NodeRef) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    fn persist_node(&self, node: &Node) {
        let record = NodeRecord {
            kind: node.kind(),
            id: node.node_ref().id.clone(),
            sides: node.sides(),
        };
        if let Err(err) = self.persistence.add_node(record) {
            warn!(node = %node.node_ref(), error = %err, "could not persist node");
        }
    }

    fn register_port(&mut self, node: &NodeRef, side: &str, index: u32) -> Result<PortId, BoardError> {
        let meta = PointMeta::new(node.clone(), side, index);
        let port = self.registry.register(&meta, node.kind.default_direction())?;
        let side = self
            .registry
            .resolve_by_id(&port)
            .map(|m| m.side.clone())
            .unwrap_or_else(|| side.to_string());
        if let Some(entry) = self.nodes.get_mut(node) {
            entry.attach(&side, port.clone());
        }
        Ok(port)
    }

    /// Adds a node with one port on each of `sides`.
    pub fn add_node<S: AsRef<str>>(&mut self, kind: NodeKind, id: &str, sides: &[S]) -> Result<NodeRef, BoardError> {
        let node_ref = NodeRef::new(kind, id);
        if id.is_empty() || id.contains(':') {
            return Err(IdentityError::InvalidIdentity(format!("bad node id `{id}`")).into());
        }
        if self.nodes.contains_key(&node_ref) {
            return Err(BoardError::NodeExists(node_ref));
        }
        self.nodes.insert(node_ref.clone(), Node::new(node_ref.clone()));
        for side in sides {
            if let Err(err) = self.register_port(&node_ref, side.as_ref(), 0) {
                self.nodes.remove(&node_ref);
                self.registry.unregister_node(&node_ref);
                return Err(err);
            }
        }
        if let Some(node) = self.nodes.get(&node_ref) {
            self.persist_node(node);
        }
        debug!(node = %node_ref, "node added");
        Ok(node_ref)
    }

    /// Adds one more port on `side`, after the existing ones.
    pub fn add_port(&mut self, node: &NodeRef, side: &str) -> Result<PortId, BoardError> {
        let index = self
            .nodes
            .get(node)
            .ok_or_else(|| BoardError::UnknownNode(node.clone()))?
            .next_index(side);
        let port = self.register_port(node, side, index)?;
        if let Some(entry) = self.nodes.get(node) {
            self.persist_node(entry);
        }
        Ok(port)
    }

    /// Removes a node and everything hanging off it.
    pub fn remove_node(&mut self, node: &NodeRef) -> Result<Vec<ConnectionId>, BoardError> {
        if self.nodes.remove(node).is_none() {
            return Err(BoardError::UnknownNode(node.clone()));
        }
        let removed: Vec<ConnectionId> = self
            .graph
            .remove_all_for(node)
            .into_iter()
            .map(|c| c.id)
            .collect();
        for id in &removed {
            self.observers.removed(id);
        }
        if let Err(err) = self.persistence.remove_node(node) {
            warn!(node = %node, error = %err, "could not prune persisted node");
        }
        self.registry.unregister_node(node);
        info!(node = %node, connections = removed.len(), "node removed");
        Ok(removed)
    }

    pub fn connect(&mut self, from: &PointMeta, to: &PointMeta) -> Result<Connection, Rejected> {
        for point in [from, to] {
            if !self.nodes.contains_key(&point.node) {
                return Err(Rejected::UnknownNode(point.node.clone()));
            }
        }
        let connection = self
            .factory
            .create(&mut self.registry, &mut self.graph, from, to)?;
        for (node, port) in [
            (&connection.source_node, &connection.source),
            (&connection.sink_node, &connection.sink),
        ] {
            if let (Some(entry), Some(meta)) = (self.nodes.get_mut(node), self.registry.resolve_by_id(port)) {
                entry.attach(&meta.side, port.clone());
            }
        }
        if let Some(record) = EdgeRecord::of(&connection) {
            if let Err(err) = self.persistence.add_edge(record) {
                warn!(connection = %connection.id, error = %err, "could not persist connection");
            }
        }
        self.observers.created(&connection);
        Ok(connection)
    }

    pub fn connect_ports(&mut self, from: &PortId, to: &PortId) -> Result<Connection, Rejected> {
        let from = self.point_of(from)?;
        let to = self.point_of(to)?;
        self.connect(&from, &to)
    }

    fn point_of(&self, id: &PortId) -> Result<PointMeta, Rejected> {
        match self.registry.resolve_by_id(id) {
            Some(meta) => Ok(meta.clone()),
            None => Ok(PortId::parse(id.as_str())?),
        }
    }

    pub fn disconnect(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.graph.remove(id)?;
        if let Some(record) = EdgeRecord::of(&connection) {
            let signature = record.signature();
            if let Err(err) = self.persistence.remove_where(|r| r.signature() == signature) {
                warn!(connection = %id, error = %err, "could not prune persisted connection");
            }
        }
        self.observers.removed(id);
        Some(connection)
    }

    pub fn port(&self, id: &PortId) -> Option<Port> {
        let meta = self.registry.resolve_by_id(id)?;
        Some(Port {
            id: id.clone(),
            direction: self.registry.get_direction(id)?,
            owner: meta.node.clone(),
            connections: self.graph.connections_of_port(id),
        })
    }

    /// Changes a port's direction. Refused while connections depend on the
    /// current direction, and for sink hubs.
    pub fn set_direction(&mut self, id: &PortId, direction: Direction) -> Result<(), BoardError> {
        let port = self
            .port(id)
            .ok_or_else(|| IdentityError::UnknownPort(id.clone()))?;
        if port.direction == direction {
            return Ok(());
        }
        if port.owner.kind.has_fixed_direction() {
            return Err(BoardError::FixedDirection(id.clone()));
        }
        if port.is_pinned() {
            return Err(BoardError::PortPinned(id.clone()));
        }
        self.registry.set_direction(id, direction)?;
        Ok(())
    }

    pub fn toggle_direction(&mut self, id: &PortId) -> Result<Direction, BoardError> {
        let next = self
            .registry
            .get_direction(id)
            .ok_or_else(|| IdentityError::UnknownPort(id.clone()))?
            .flipped();
        self.set_direction(id, next)?;
        Ok(next)
    }

    pub fn neighbors_of(&self, node: &NodeRef, direction: EdgeDirection) -> Vec<Neighbor> {
        self.graph.neighbors_of(node, direction)
    }

    pub fn record_transmission(&mut self, id: &ConnectionId, payload: &Message) -> bool {
        self.graph.record_transmission(id, payload)
    }

    /// An agent linked to any sink hub, in either direction, may reach the web.
    pub fn has_web_access(&self, agent: &NodeRef) -> bool {
        self.graph
            .connections_of(agent)
            .iter()
            .any(|c| c.other_end(agent).is_some_and(|n| n.kind == NodeKind::SinkHub))
    }

    /// Rebuilds nodes and connections from storage. Edges that no longer
    /// validate are skipped and pruned from storage.
    pub fn restore(&mut self) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        for record in self.persistence.load_nodes() {
            match self.add_node(record.kind, &record.id, &record.sides) {
                Ok(_) => summary.nodes += 1,
                Err(BoardError::NodeExists(_)) => {}
                Err(err) => warn!(node = %record.node_ref(), error = %err, "skipping stored node"),
            }
        }
        let mut rejected = HashSet::new();
        for record in self.persistence.load_all() {
            match self.connect(&record.from_point(), &record.to_point()) {
                Ok(_) => summary.links += 1,
                Err(Rejected::DuplicateConnection(_)) => {}
                Err(err) => {
                    debug!(edge = %record.signature(), error = %err, "dropping stored edge");
                    rejected.insert(record.signature());
                    summary.dropped += 1;
                }
            }
        }
        if !rejected.is_empty() {
            if let Err(err) = self.persistence.remove_where(|r| rejected.contains(&r.signature())) {
                warn!(error = %err, "could not prune dropped edges");
            }
        }
        info!(nodes = summary.nodes, links = summary.links, dropped = summary.dropped, "board restored");
        summary
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.persistence.snapshot(self.registry.export_directions())
    }

    /// Stores the snapshot's content and restores from it.
    pub fn import(&mut self, snapshot: &BoardSnapshot) -> Result<RestoreSummary, PersistenceError> {
        self.persistence.import(snapshot)?;
        let directions: BTreeMap<String, String> = snapshot
            .directions
            .iter()
            .map(|(id, dir)| (id.clone(), dir.to_string()))
            .collect();
        self.registry.import_directions(&directions);
        Ok(self.restore())
    }
}
