use serde::Serialize;

use crate::{
    connection::ConnectionId,
    identity::{Direction, PortId},
    node::NodeRef,
};

/// Point-in-time view of a port: identity, direction and live connections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Port {
    pub id: PortId,
    pub direction: Direction,
    pub owner: NodeRef,
    pub connections: Vec<ConnectionId>,
}

impl Port {
    /// A port with live connections has its direction locked in.
    pub fn is_pinned(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn is_source(&self) -> bool {
        self.direction == Direction::Source
    }

    pub fn is_sink(&self) -> bool {
        self.direction == Direction::Sink
    }
}
