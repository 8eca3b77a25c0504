use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    backend::{AgentBackend, SectionSink},
    board::SharedBoard,
    connection::ConnectionId,
    graph::EdgeDirection,
    message::Message,
    node::{NodeKind, NodeRef},
    transcript::{Speaker, TranscriptEntry, TranscriptStore},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DispatchOutcome {
    /// Payload added to a human transcript.
    Appended,
    /// An agent turn was started and runs in the background.
    TurnStarted,
    SectionUpdated,
    /// Sink hubs take no payloads.
    Ignored,
    /// The edge was already traversed in this pass.
    AlreadyVisited,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub target: NodeRef,
    pub connection_id: Option<ConnectionId>,
    pub outcome: DispatchOutcome,
}

/// What one fan-out step did for each neighbor, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub origin: NodeRef,
    pub dispatches: Vec<Dispatch>,
}

impl DeliveryReport {
    pub fn new(origin: NodeRef) -> Self {
        Self {
            origin,
            dispatches: Vec::new(),
        }
    }

    fn push(&mut self, target: NodeRef, connection_id: Option<ConnectionId>, outcome: DispatchOutcome) {
        self.dispatches.push(Dispatch {
            target,
            connection_id,
            outcome,
        });
    }

    pub fn targets(&self) -> Vec<NodeRef> {
        self.dispatches.iter().map(|d| d.target.clone()).collect()
    }

    pub fn failures(&self) -> Vec<&Dispatch> {
        self.dispatches
            .iter()
            .filter(|d| matches!(d.outcome, DispatchOutcome::Failed { .. }))
            .collect()
    }
}

/// Bookkeeping for one delivery pass, shared by every nested fan-out it
/// triggers.
///
/// Edges are tracked so a cycle is walked at most once per edge while two
/// parallel edges still both deliver. Nodes whose reply the pass has already
/// fanned out are tracked so an agent is never re-triggered by its own
/// reply coming back around.
#[derive(Debug, Clone, Default)]
pub struct DeliveryPass {
    visited: Arc<Mutex<HashSet<ConnectionId>>>,
    origins: Arc<Mutex<HashSet<NodeRef>>>,
}

impl DeliveryPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as traversed; false when it already was.
    pub fn visit(&self, id: &ConnectionId) -> bool {
        self.visited
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone())
    }

    pub fn visited_len(&self) -> usize {
        self.visited.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Records that `node` is fanning a payload out in this pass.
    pub fn mark_origin(&self, node: &NodeRef) {
        self.origins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.clone());
    }

    pub fn is_origin(&self, node: &NodeRef) -> bool {
        self.origins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(node)
    }

    /// Whether delivering to `target` would start a turn the pass already
    /// produced. Humans and sections take a payload back without re-triggering.
    fn would_retrigger(&self, target: &NodeRef) -> bool {
        target.kind == NodeKind::Agent && self.is_origin(target)
    }
}

/// Pushes payloads along outgoing connections.
///
/// Dispatch to neighbors is sequential and never waits on an agent: agent
/// turns run as tracked background tasks, and their replies fan out again
/// within the same pass.
pub struct FanOutRouter {
    board: SharedBoard,
    backend: Arc<dyn AgentBackend>,
    sections: Arc<dyn SectionSink>,
    transcripts: TranscriptStore,
    tracker: TaskTracker,
}

impl FanOutRouter {
    pub fn new(
        board: SharedBoard,
        backend: Arc<dyn AgentBackend>,
        sections: Arc<dyn SectionSink>,
        transcripts: TranscriptStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            board,
            backend,
            sections,
            transcripts,
            tracker: TaskTracker::new(),
        })
    }

    pub fn board(&self) -> &SharedBoard {
        &self.board
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    /// Starts a new pass from `origin`.
    #[tracing::instrument(skip_all, fields(origin = %origin))]
    pub async fn fan_out(self: &Arc<Self>, origin: &NodeRef, message: Message) -> DeliveryReport {
        self.clone()
            .fan_out_in_pass(origin.clone(), message, DeliveryPass::new())
            .await
    }

    pub fn fan_out_in_pass(
        self: Arc<Self>,
        origin: NodeRef,
        message: Message,
        pass: DeliveryPass,
    ) -> BoxFuture<'static, DeliveryReport> {
        async move {
            pass.mark_origin(&origin);
            let steps: Vec<_> = {
                let mut board = self.board.write().await;
                board
                    .neighbors_of(&origin, EdgeDirection::Out)
                    .into_iter()
                    .map(|neighbor| {
                        let first = !pass.would_retrigger(&neighbor.node) && pass.visit(&neighbor.connection_id);
                        if first {
                            board.record_transmission(&neighbor.connection_id, &message);
                        }
                        (neighbor, first)
                    })
                    .collect()
            };

            let mut report = DeliveryReport::new(origin);
            for (neighbor, first) in steps {
                let outcome = if first {
                    self.dispatch(&neighbor.node, Some(neighbor.connection_id.clone()), &message, &pass)
                } else {
                    DispatchOutcome::AlreadyVisited
                };
                debug!(target_node = %neighbor.node, connection = %neighbor.connection_id, ?outcome, "dispatched");
                report.push(neighbor.node, Some(neighbor.connection_id), outcome);
            }
            info!(
                target: "delivery",
                origin = %report.origin,
                dispatched = report.dispatches.len(),
                failed = report.failures().len(),
                "fan-out"
            );
            report
        }
        .boxed()
    }

    fn dispatch(
        self: &Arc<Self>,
        target: &NodeRef,
        via: Option<ConnectionId>,
        message: &Message,
        pass: &DeliveryPass,
    ) -> DispatchOutcome {
        match target.kind {
            NodeKind::Agent => {
                self.transcripts
                    .append(target, TranscriptEntry::from_message(Speaker::User, message, via.clone()));
                self.spawn_turn(target.clone(), via, message.clone(), pass.clone());
                DispatchOutcome::TurnStarted
            }
            NodeKind::Human => {
                self.transcripts
                    .append(target, TranscriptEntry::from_message(Speaker::Assistant, message, via));
                DispatchOutcome::Appended
            }
            NodeKind::Section => match self.sections.append_to_section(&target.id, message) {
                Ok(()) => DispatchOutcome::SectionUpdated,
                Err(err) => {
                    warn!(section = %target.id, error = %err, "section append failed");
                    let reason = err.to_string();
                    self.transcripts
                        .append(target, TranscriptEntry::failure(target, &reason, via));
                    DispatchOutcome::Failed { reason }
                }
            },
            NodeKind::SinkHub => DispatchOutcome::Ignored,
        }
    }

    fn spawn_turn(self: &Arc<Self>, agent: NodeRef, via: Option<ConnectionId>, message: Message, pass: DeliveryPass) {
        let span = info_span!("agent_turn", agent = %agent);
        self.tracker
            .spawn(self.clone().agent_turn(agent, via, message, pass).instrument(span));
    }

    async fn agent_turn(self: Arc<Self>, agent: NodeRef, via: Option<ConnectionId>, message: Message, pass: DeliveryPass) {
        let result = self.backend.send_turn(&agent.id, &message).await;
        if !self.still_routed(&agent, via.as_ref()).await {
            info!("discarding response for a removed route");
            return;
        }
        match result {
            Ok(reply) => {
                self.transcripts
                    .append(&agent, TranscriptEntry::from_message(Speaker::Assistant, &reply, via));
                let report = self.clone().fan_out_in_pass(agent, reply, pass).await;
                debug!(dispatches = report.dispatches.len(), "reply fanned out");
            }
            Err(err) => {
                warn!(error = %err, "delivery failed");
                self.transcripts
                    .append(&agent, TranscriptEntry::failure(&agent, &err.to_string(), via));
            }
        }
    }

    async fn still_routed(&self, agent: &NodeRef, via: Option<&ConnectionId>) -> bool {
        let board = self.board.read().await;
        match via {
            Some(id) => board.graph().contains(id),
            None => board.contains_node(agent),
        }
    }

    /// Delivers a message typed directly into `destination`. A human node
    /// keeps it and fans it out; other kinds handle it as if it arrived over
    /// an edge.
    pub async fn deliver_to(self: &Arc<Self>, destination: &NodeRef, message: Message) -> DeliveryReport {
        if !self.board.read().await.contains_node(destination) {
            warn!(destination = %destination, "dropping message for unknown node");
            let mut report = DeliveryReport::new(destination.clone());
            report.push(
                destination.clone(),
                None,
                DispatchOutcome::Failed {
                    reason: format!("node {destination} is not on the board"),
                },
            );
            return report;
        }
        if destination.kind == NodeKind::Human {
            self.transcripts
                .append(destination, TranscriptEntry::from_message(Speaker::User, &message, None));
            let mut report = self
                .clone()
                .fan_out_in_pass(destination.clone(), message, DeliveryPass::new())
                .await;
            report.dispatches.insert(
                0,
                Dispatch {
                    target: destination.clone(),
                    connection_id: None,
                    outcome: DispatchOutcome::Appended,
                },
            );
            return report;
        }
        let outcome = self.dispatch(destination, None, &message, &DeliveryPass::new());
        let mut report = DeliveryReport::new(destination.clone());
        report.push(destination.clone(), None, outcome);
        report
    }

    /// Waits until every background agent turn, including the ones they
    /// trigger, has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
