use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{identity::PortId, message::Message, node::NodeRef};

/// `link_<source-port>__<sink-port>`. At most one connection per ordered
/// port pair can exist, so the id doubles as the duplicate check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn between(source: &PortId, sink: &PortId) -> Self {
        ConnectionId(format!("link_{source}__{sink}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A directed edge from a source port to a sink port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source: PortId,
    pub sink: PortId,
    pub source_node: NodeRef,
    pub sink_node: NodeRef,
    pub created_at: DateTime<Utc>,
    /// Creation order, assigned by the graph on insert.
    pub seq: u64,
    #[serde(default)]
    pub last_payload: Option<Message>,
}

impl Connection {
    pub fn new(source: PortId, sink: PortId, source_node: NodeRef, sink_node: NodeRef) -> Self {
        Self {
            id: ConnectionId::between(&source, &sink),
            source,
            sink,
            source_node,
            sink_node,
            created_at: Utc::now(),
            seq: 0,
            last_payload: None,
        }
    }

    pub fn touches(&self, node: &NodeRef) -> bool {
        &self.source_node == node || &self.sink_node == node
    }

    pub fn uses_port(&self, port: &PortId) -> bool {
        &self.source == port || &self.sink == port
    }

    /// The endpoint node opposite to `node`, if `node` is an endpoint.
    pub fn other_end(&self, node: &NodeRef) -> Option<&NodeRef> {
        if &self.source_node == node {
            Some(&self.sink_node)
        } else if &self.sink_node == node {
            Some(&self.source_node)
        } else {
            None
        }
    }

    pub fn transmit(&mut self, payload: &Message) {
        self.last_payload = Some(payload.clone());
    }
}
