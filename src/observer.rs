use std::sync::Arc;

use tracing::info;

use crate::connection::{Connection, ConnectionId};

/// Receives graph changes, e.g. to draw or erase a line between two nodes.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_created(&self, connection: &Connection);
    fn on_connection_removed(&self, connection_id: &ConnectionId);
}

#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn ConnectionObserver>>);

impl Observers {
    pub fn subscribe(&mut self, observer: Arc<dyn ConnectionObserver>) {
        self.0.push(observer);
    }

    pub fn created(&self, connection: &Connection) {
        for observer in &self.0 {
            observer.on_connection_created(connection);
        }
    }

    pub fn removed(&self, connection_id: &ConnectionId) {
        for observer in &self.0 {
            observer.on_connection_removed(connection_id);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Observers({})", self.0.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_connection_created(&self, connection: &Connection) {
        info!(
            connection = %connection.id,
            from = %connection.source_node,
            to = %connection.sink_node,
            "connection created"
        );
    }

    fn on_connection_removed(&self, connection_id: &ConnectionId) {
        info!(connection = %connection_id, "connection removed");
    }
}
