use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    backend::{AgentBackend, SectionSink},
    board::{Board, BoardError, SharedBoard},
    connection::{Connection, ConnectionId},
    factory::Rejected,
    gate::{FlowGate, GateError, QueueStats},
    identity::PointMeta,
    message::Message,
    node::NodeRef,
    router::{DeliveryReport, FanOutRouter},
    storage::Storage,
    transcript::TranscriptStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Held until the flow resumes; carries the queue position.
    Queued(u64),
    Delivered(DeliveryReport),
}

/// A board wired to its router and flow gate.
///
/// The gate lock is held for the whole of a resume, so a message submitted
/// meanwhile waits and lands after everything that was queued before it.
pub struct BoardRuntime {
    board: SharedBoard,
    router: Arc<FanOutRouter>,
    gate: Arc<Mutex<FlowGate>>,
}

impl BoardRuntime {
    pub fn new(
        board: Board,
        storage: Storage,
        backend: Arc<dyn AgentBackend>,
        sections: Arc<dyn SectionSink>,
    ) -> Self {
        let board = board.shared();
        let router = FanOutRouter::new(board.clone(), backend, sections, TranscriptStore::new());
        Self {
            board,
            router,
            gate: Arc::new(Mutex::new(FlowGate::new(storage))),
        }
    }

    pub fn board(&self) -> &SharedBoard {
        &self.board
    }

    pub fn router(&self) -> &Arc<FanOutRouter> {
        &self.router
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        self.router.transcripts()
    }

    pub async fn connect(&self, from: &PointMeta, to: &PointMeta) -> Result<Connection, Rejected> {
        self.board.write().await.connect(from, to)
    }

    pub async fn disconnect(&self, id: &ConnectionId) -> Option<Connection> {
        self.board.write().await.disconnect(id)
    }

    /// Removes a node from the board, its queued input and its transcript.
    pub async fn remove_node(&self, node: &NodeRef) -> Result<Vec<ConnectionId>, BoardError> {
        let removed = self.board.write().await.remove_node(node)?;
        let dropped = self.gate.lock().await.remove_pending_for(node);
        self.transcripts().clear(node);
        debug!(node = %node, dropped, "pending input discarded");
        Ok(removed)
    }

    /// Entry point for a message typed into `destination`.
    pub async fn submit(&self, destination: &NodeRef, message: Message) -> Submission {
        let mut gate = self.gate.lock().await;
        let message = if gate.is_paused() {
            match gate.enqueue(destination, message) {
                Ok(seq) => return Submission::Queued(seq),
                Err(GateError::EnqueueWhileRunning { message, .. }) => *message,
            }
        } else {
            message
        };
        drop(gate);
        Submission::Delivered(self.router.deliver_to(destination, message).await)
    }

    pub async fn pause(&self) -> bool {
        self.gate.lock().await.pause()
    }

    pub async fn is_paused(&self) -> bool {
        self.gate.lock().await.is_paused()
    }

    /// Replays queued messages through the normal delivery path and returns
    /// how many were replayed.
    #[tracing::instrument(skip_all)]
    pub async fn resume(&self) -> usize {
        let mut gate = self.gate.lock().await;
        let destinations = gate.begin_resume();
        let mut replayed = 0;
        for destination in destinations {
            while let Some(queued) = gate.next_for(&destination) {
                debug!(destination = %destination, seq = queued.seq, "replaying");
                self.router.deliver_to(&destination, queued.message).await;
                replayed += 1;
            }
        }
        gate.finish_resume();
        info!(replayed, "queue drained");
        replayed
    }

    /// Pauses when running, resumes when paused.
    pub async fn toggle(&self) -> bool {
        if self.is_paused().await {
            self.resume().await;
            false
        } else {
            self.pause().await;
            true
        }
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.gate.lock().await.stats()
    }

    pub async fn wait_idle(&self) {
        self.router.wait_idle().await;
    }
}
