use std::collections::HashMap;

use petgraph::{
    algo::is_cyclic_directed,
    graph::{DiGraph, NodeIndex},
    visit::Dfs,
};

use crate::{
    connection::{Connection, ConnectionId},
    identity::PortId,
    message::Message,
    node::NodeRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// Edges leaving the node (node is the source).
    Out,
    /// Edges entering the node (node is the sink).
    In,
}

/// One adjacent node together with the edge that reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub node: NodeRef,
    pub connection_id: ConnectionId,
}

/// Live connections indexed by id, by node and by port.
///
/// The per-node and per-port lists keep insertion order, which is the order
/// fan-out visits neighbors in. Queries cost O(degree); only `export` walks
/// every edge.
#[derive(Debug, Default)]
pub struct ConnectionGraph {
    connections: HashMap<ConnectionId, Connection>,
    by_node: HashMap<NodeRef, Vec<ConnectionId>>,
    by_port: HashMap<PortId, Vec<ConnectionId>>,
    next_seq: u64,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Inserts a connection and stamps its creation order. An existing
    /// connection with the same id is returned untouched.
    pub fn add(&mut self, mut connection: Connection) -> &Connection {
        let id = connection.id.clone();
        if !self.connections.contains_key(&id) {
            connection.seq = self.next_seq;
            self.next_seq += 1;
            for node in [&connection.source_node, &connection.sink_node] {
                self.by_node.entry(node.clone()).or_default().push(id.clone());
            }
            for port in [&connection.source, &connection.sink] {
                self.by_port.entry(port.clone()).or_default().push(id.clone());
            }
            self.connections.insert(id.clone(), connection);
        }
        &self.connections[&id]
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        for node in [&connection.source_node, &connection.sink_node] {
            Self::unindex(&mut self.by_node, node, id);
        }
        for port in [&connection.source, &connection.sink] {
            Self::unindex(&mut self.by_port, port, id);
        }
        Some(connection)
    }

    fn unindex<K: std::hash::Hash + Eq>(
        index: &mut HashMap<K, Vec<ConnectionId>>,
        key: &K,
        id: &ConnectionId,
    ) {
        if let Some(ids) = index.get_mut(key) {
            ids.retain(|c| c != id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }

    /// Removes every connection touching `node`, in creation order.
    pub fn remove_all_for(&mut self, node: &NodeRef) -> Vec<Connection> {
        let ids = self.by_node.get(node).cloned().unwrap_or_default();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn neighbors_of(&self, node: &NodeRef, direction: EdgeDirection) -> Vec<Neighbor> {
        let Some(ids) = self.by_node.get(node) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id))
            .filter_map(|c| {
                let other = match direction {
                    EdgeDirection::Out if &c.source_node == node => &c.sink_node,
                    EdgeDirection::In if &c.sink_node == node => &c.source_node,
                    _ => return None,
                };
                Some(Neighbor {
                    node: other.clone(),
                    connection_id: c.id.clone(),
                })
            })
            .collect()
    }

    /// Every connection between `a` and `b`, in either direction.
    pub fn connections_between(&self, a: &NodeRef, b: &NodeRef) -> Vec<&Connection> {
        self.connections_of(a)
            .into_iter()
            .filter(|c| c.other_end(a) == Some(b))
            .collect()
    }

    pub fn connections_of(&self, node: &NodeRef) -> Vec<&Connection> {
        self.by_node
            .get(node)
            .map(|ids| ids.iter().filter_map(|id| self.connections.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn connections_of_port(&self, port: &PortId) -> Vec<ConnectionId> {
        self.by_port.get(port).cloned().unwrap_or_default()
    }

    pub fn is_port_pinned(&self, port: &PortId) -> bool {
        self.by_port.get(port).is_some_and(|ids| !ids.is_empty())
    }

    pub fn record_transmission(&mut self, id: &ConnectionId, payload: &Message) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) => {
                connection.transmit(payload);
                true
            }
            None => false,
        }
    }

    /// Every connection, oldest first.
    pub fn export(&self) -> Vec<&Connection> {
        let mut all: Vec<&Connection> = self.connections.values().collect();
        all.sort_by_key(|c| c.seq);
        all
    }

    /// Node-level directed graph, one edge per connection.
    pub fn to_digraph(&self) -> DiGraph<NodeRef, ConnectionId> {
        let mut graph = DiGraph::new();
        let mut index_of: HashMap<NodeRef, NodeIndex> = HashMap::new();
        for connection in self.export() {
            let mut index = |node: &NodeRef, graph: &mut DiGraph<NodeRef, ConnectionId>| {
                *index_of
                    .entry(node.clone())
                    .or_insert_with(|| graph.add_node(node.clone()))
            };
            let from = index(&connection.source_node, &mut graph);
            let to = index(&connection.sink_node, &mut graph);
            graph.add_edge(from, to, connection.id.clone());
        }
        graph
    }

    /// True when some payload could travel back to a node it left from.
    pub fn has_feedback_loop(&self) -> bool {
        is_cyclic_directed(&self.to_digraph())
    }

    /// Nodes reachable from `start` by following edge directions.
    pub fn reachable_from(&self, start: &NodeRef) -> Vec<NodeRef> {
        let graph = self.to_digraph();
        let Some(origin) = graph.node_indices().find(|i| &graph[*i] == start) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&graph, origin);
        let mut reached = Vec::new();
        while let Some(ix) = dfs.next(&graph) {
            if ix != origin {
                reached.push(graph[ix].clone());
            }
        }
        reached
    }
}
