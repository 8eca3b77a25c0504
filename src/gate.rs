use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{message::Message, node::NodeRef, storage::Storage};

pub const PAUSED_KEY: &str = "nodeboard.flow.paused";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// Hands the message back so the caller can deliver it directly.
    #[error("message for {destination} was queued while the flow is running")]
    EnqueueWhileRunning {
        destination: NodeRef,
        message: Box<Message>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Running,
    Paused,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub seq: u64,
    pub message: Message,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub paused: bool,
    pub length: usize,
    pub destinations: usize,
    pub oldest: Option<DateTime<Utc>>,
}

/// Global pause switch plus per-destination holding queues.
///
/// Only `pause`, `begin_resume`/`finish_resume` and `enqueue` change the
/// state. Queues exist only while paused or while a resume is draining them.
#[derive(Debug)]
pub struct FlowGate {
    state: GateState,
    queues: HashMap<NodeRef, VecDeque<QueuedMessage>>,
    /// Destinations in order of their first queued message.
    order: Vec<NodeRef>,
    next_seq: u64,
    storage: Storage,
}

impl FlowGate {
    /// Starts in the state last persisted in `storage`.
    pub fn new(storage: Storage) -> Self {
        let paused = storage.get_item(PAUSED_KEY).as_deref() == Some("true");
        Self {
            state: if paused { GateState::Paused } else { GateState::Running },
            queues: HashMap::new(),
            order: Vec::new(),
            next_seq: 0,
            storage,
        }
    }

    fn persist(&self) {
        let value = if self.is_paused() { "true" } else { "false" };
        if let Err(err) = self.storage.set_item(PAUSED_KEY, value) {
            warn!(error = %err, "could not persist flow state");
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == GateState::Paused
    }

    /// Returns false when already paused.
    pub fn pause(&mut self) -> bool {
        if self.is_paused() {
            return false;
        }
        self.state = GateState::Paused;
        self.persist();
        info!("flow paused");
        true
    }

    pub fn enqueue(&mut self, destination: &NodeRef, message: Message) -> Result<u64, GateError> {
        if !self.is_paused() {
            error!(destination = %destination, "enqueue while running; message must be delivered directly");
            return Err(GateError::EnqueueWhileRunning {
                destination: destination.clone(),
                message: Box::new(message),
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let queue = self.queues.entry(destination.clone()).or_default();
        if queue.is_empty() && !self.order.contains(destination) {
            self.order.push(destination.clone());
        }
        queue.push_back(QueuedMessage {
            seq,
            message,
            queued_at: Utc::now(),
        });
        Ok(seq)
    }

    /// Switches to running and hands back the destinations to drain, in
    /// replay order. Empty when the gate was not paused.
    pub fn begin_resume(&mut self) -> Vec<NodeRef> {
        if !self.is_paused() {
            return Vec::new();
        }
        self.state = GateState::Running;
        self.order
            .iter()
            .filter(|d| self.queues.get(*d).is_some_and(|q| !q.is_empty()))
            .cloned()
            .collect()
    }

    /// Pops the oldest queued message for `destination`. The queue is
    /// dropped once drained.
    pub fn next_for(&mut self, destination: &NodeRef) -> Option<QueuedMessage> {
        let queue = self.queues.get_mut(destination)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(destination);
            self.order.retain(|d| d != destination);
        }
        next
    }

    pub fn finish_resume(&mut self) {
        self.persist();
        info!(left = self.queued_len(), "flow resumed");
    }

    pub fn pending_for(&self, destination: &NodeRef) -> usize {
        self.queues.get(destination).map(VecDeque::len).unwrap_or(0)
    }

    /// Drops queued messages for a node that is going away.
    pub fn remove_pending_for(&mut self, destination: &NodeRef) -> usize {
        self.order.retain(|d| d != destination);
        self.queues
            .remove(destination)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn queued_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.queued_len();
        self.queues.clear();
        self.order.clear();
        dropped
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            paused: self.is_paused(),
            length: self.queued_len(),
            destinations: self.queues.len(),
            oldest: self
                .queues
                .values()
                .filter_map(|q| q.front())
                .map(|m| m.queued_at)
                .min(),
        }
    }
}
