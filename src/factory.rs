use thiserror::Error;
use tracing::{debug, info};

use crate::{
    connection::{Connection, ConnectionId},
    graph::ConnectionGraph,
    identity::{Direction, IdentityError, IdentityRegistry, PointMeta, PortId},
    node::NodeRef,
    port::Port,
};

/// Why a requested connection was not created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error(transparent)]
    InvalidIdentity(#[from] IdentityError),
    #[error("cannot connect {0} to itself")]
    SameNode(NodeRef),
    #[error("{source_port} cannot feed {sink_port}: expected a source port feeding a sink port")]
    DirectionMismatch { source_port: PortId, sink_port: PortId },
    #[error("connection {0} already exists")]
    DuplicateConnection(ConnectionId),
    #[error("node {0} is not on the board")]
    UnknownNode(NodeRef),
}

impl Rejected {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Rejected::DuplicateConnection(_))
    }
}

/// Outcome of direction resolution for a candidate connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionResolution {
    /// The drag started on the sink end; the endpoints trade roles.
    pub reversed: bool,
    /// Drop-target port that has to be switched to sink before linking.
    pub snap_to_sink: Option<PortId>,
}

/// Decides whether `from` may feed `to`.
///
/// A source feeding a sink is taken as is. A drag from a sink onto a source
/// is reversed, so the source end still comes first. A source dropped onto
/// another source switches the drop target to sink, but only while no live
/// connection depends on it. Nothing else is ever flipped.
pub fn resolve_directions(from: &Port, to: &Port) -> Result<DirectionResolution, Rejected> {
    let mismatch = || Rejected::DirectionMismatch {
        source_port: from.id.clone(),
        sink_port: to.id.clone(),
    };
    let resolved = |reversed: bool, snap_to_sink: Option<PortId>| -> Result<DirectionResolution, Rejected> {
        Ok(DirectionResolution { reversed, snap_to_sink })
    };
    match (from.direction, to.direction) {
        (Direction::Source, Direction::Sink) => resolved(false, None),
        (Direction::Sink, Direction::Source) => resolved(true, None),
        (Direction::Source, Direction::Source) if !to.is_pinned() => resolved(false, Some(to.id.clone())),
        _ => Err(mismatch()),
    }
}

/// Validates and builds connections. Any candidate passing here is a legal
/// edge: distinct nodes, source to sink, not yet present.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionFactory;

impl ConnectionFactory {
    pub fn new() -> Self {
        Self
    }

    fn port_view(registry: &IdentityRegistry, graph: &ConnectionGraph, id: &PortId) -> Result<Port, Rejected> {
        let meta = registry
            .resolve_by_id(id)
            .ok_or_else(|| IdentityError::UnknownPort(id.clone()))?;
        let direction = registry
            .get_direction(id)
            .ok_or_else(|| IdentityError::UnknownPort(id.clone()))?;
        Ok(Port {
            id: id.clone(),
            direction,
            owner: meta.node.clone(),
            connections: graph.connections_of_port(id),
        })
    }

    /// Registers both points if needed, resolves directions and inserts the
    /// new connection into `graph`.
    pub fn create(
        &self,
        registry: &mut IdentityRegistry,
        graph: &mut ConnectionGraph,
        from: &PointMeta,
        to: &PointMeta,
    ) -> Result<Connection, Rejected> {
        let from_id = registry.register(from, from.node.kind.default_direction())?;
        let to_id = registry.register(to, to.node.kind.default_direction())?;
        if from.node == to.node {
            return Err(Rejected::SameNode(from.node.clone()));
        }

        let from_port = Self::port_view(registry, graph, &from_id)?;
        let to_port = Self::port_view(registry, graph, &to_id)?;
        let resolution = resolve_directions(&from_port, &to_port).inspect_err(|err| {
            debug!(error = %err, "direction check failed");
        })?;
        if let Some(port) = &resolution.snap_to_sink {
            registry.set_direction(port, Direction::Sink)?;
            info!(port = %port, "drop target switched to sink");
        }
        let (source, sink) = if resolution.reversed {
            info!(source = %to_port.id, sink = %from_port.id, "drag started on the sink end; linking source first");
            (to_port, from_port)
        } else {
            (from_port, to_port)
        };

        let id = ConnectionId::between(&source.id, &sink.id);
        if graph.contains(&id) {
            info!(connection = %id, "already connected");
            return Err(Rejected::DuplicateConnection(id));
        }
        let connection = Connection::new(source.id, sink.id, source.owner, sink.owner);
        Ok(graph.add(connection).clone())
    }
}
