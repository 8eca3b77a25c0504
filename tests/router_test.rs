use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nodeboard::backend::{AgentBackend, BackendError, InMemorySections, SectionError, SectionSink};
use nodeboard::board::{Board, SharedBoard};
use nodeboard::connection::ConnectionId;
use nodeboard::identity::PointMeta;
use nodeboard::message::Message;
use nodeboard::node::{NodeKind, NodeRef};
use nodeboard::router::{DispatchOutcome, FanOutRouter};
use nodeboard::storage::Storage;
use nodeboard::transcript::{Speaker, TranscriptStore};
use tokio::sync::Notify;

const SIDES: [&str; 4] = ["t", "r", "b", "l"];

/// Agent backend that records every turn and can hold or fail chosen agents.
#[derive(Default)]
struct ScriptedBackend {
    calls: Mutex<Vec<(String, String)>>,
    failing: HashSet<String>,
    holds: HashMap<String, Arc<Notify>>,
}

impl ScriptedBackend {
    fn failing(agent: &str) -> Self {
        Self {
            failing: HashSet::from([agent.to_string()]),
            ..Default::default()
        }
    }

    fn holding(agent: &str) -> (Self, Arc<Notify>) {
        let hold = Arc::new(Notify::new());
        let backend = Self {
            holds: HashMap::from([(agent.to_string(), hold.clone())]),
            ..Default::default()
        };
        (backend, hold)
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, agent: &str) -> usize {
        self.calls().iter().filter(|(a, _)| a == agent).count()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn send_turn(&self, node_id: &str, message: &Message) -> Result<Message, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push((node_id.to_string(), message.text().to_string()));
        if let Some(hold) = self.holds.get(node_id) {
            hold.notified().await;
        }
        if self.failing.contains(node_id) {
            return Err(BackendError::Unreachable {
                agent: node_id.to_string(),
                reason: "offline".to_string(),
            });
        }
        Ok(Message::new(node_id, &format!("{node_id} saw: {}", message.text())))
    }
}

/// Rejects appends to the `locked` section.
#[derive(Default)]
struct LockedSections(InMemorySections);

impl SectionSink for LockedSections {
    fn append_to_section(&self, section_id: &str, message: &Message) -> Result<(), SectionError> {
        if section_id == "locked" {
            return Err(SectionError::Write {
                section: section_id.to_string(),
                reason: "read only".to_string(),
            });
        }
        self.0.append_to_section(section_id, message)
    }
}

struct Harness {
    board: SharedBoard,
    router: Arc<FanOutRouter>,
    backend: Arc<ScriptedBackend>,
    sections: Arc<LockedSections>,
    transcripts: TranscriptStore,
}

impl Harness {
    fn new(board: Board, backend: ScriptedBackend) -> Self {
        let board = board.shared();
        let backend = Arc::new(backend);
        let sections = Arc::new(LockedSections::default());
        let transcripts = TranscriptStore::new();
        let router = FanOutRouter::new(board.clone(), backend.clone(), sections.clone(), transcripts.clone());
        Self {
            board,
            router,
            backend,
            sections,
            transcripts,
        }
    }
}

fn board_with(nodes: &[(NodeKind, &str)]) -> Board {
    let mut board = Board::new(Storage::in_memory());
    for (kind, id) in nodes {
        board.add_node(*kind, id, &SIDES).unwrap();
    }
    board
}

fn link(board: &mut Board, from: (NodeKind, &str, &str), to: (NodeKind, &str, &str)) -> ConnectionId {
    board
        .connect(&PointMeta::on(from.0, from.1, from.2), &PointMeta::on(to.0, to.1, to.2))
        .unwrap()
        .id
}

#[tokio::test]
async fn dispatch_order_does_not_wait_for_slow_agents() {
    let mut board = board_with(&[
        (NodeKind::Human, "me"),
        (NodeKind::Agent, "a"),
        (NodeKind::Agent, "b"),
        (NodeKind::Human, "c"),
    ]);
    link(&mut board, (NodeKind::Human, "me", "r"), (NodeKind::Agent, "a", "l"));
    link(&mut board, (NodeKind::Human, "me", "b"), (NodeKind::Agent, "b", "t"));
    link(&mut board, (NodeKind::Human, "me", "t"), (NodeKind::Human, "c", "b"));
    let (backend, hold_b) = ScriptedBackend::holding("b");
    let h = Harness::new(board, backend);

    let report = h.router.fan_out(&NodeRef::human("me"), Message::new("me", "hello")).await;
    assert_eq!(
        report.targets(),
        vec![NodeRef::agent("a"), NodeRef::agent("b"), NodeRef::human("c")]
    );
    let outcomes: Vec<DispatchOutcome> = report.dispatches.iter().map(|d| d.outcome.clone()).collect();
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::TurnStarted, DispatchOutcome::TurnStarted, DispatchOutcome::Appended]
    );
    // c got the payload even though b has not answered
    assert_eq!(h.transcripts.texts(&NodeRef::human("c"), Speaker::Assistant), vec!["hello"]);
    assert!(h.transcripts.texts(&NodeRef::agent("b"), Speaker::Assistant).is_empty());

    hold_b.notify_one();
    h.router.wait_idle().await;
    assert_eq!(
        h.transcripts.texts(&NodeRef::agent("b"), Speaker::Assistant),
        vec!["b saw: hello"]
    );
    assert_eq!(h.router.in_flight(), 0);
}

#[tokio::test]
async fn one_failing_agent_does_not_stop_the_others() {
    let mut board = board_with(&[
        (NodeKind::Human, "me"),
        (NodeKind::Agent, "a"),
        (NodeKind::Agent, "b"),
        (NodeKind::Section, "locked"),
        (NodeKind::Section, "notes"),
    ]);
    link(&mut board, (NodeKind::Human, "me", "r"), (NodeKind::Agent, "a", "l"));
    link(&mut board, (NodeKind::Human, "me", "t"), (NodeKind::Section, "locked", "l"));
    link(&mut board, (NodeKind::Human, "me", "b"), (NodeKind::Agent, "b", "l"));
    link(&mut board, (NodeKind::Human, "me", "l"), (NodeKind::Section, "notes", "l"));
    let h = Harness::new(board, ScriptedBackend::failing("a"));

    let report = h.router.fan_out(&NodeRef::human("me"), Message::new("me", "draft")).await;
    assert_eq!(report.dispatches.len(), 4);
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].target, NodeRef::section("locked"));
    assert_eq!(h.sections.0.content("notes").as_deref(), Some("draft"));
    assert_eq!(
        h.transcripts.entries(&NodeRef::section("locked"))[0].speaker,
        Speaker::Error
    );

    h.router.wait_idle().await;
    let a = h.transcripts.entries(&NodeRef::agent("a"));
    assert_eq!(a.last().unwrap().speaker, Speaker::Error);
    assert!(a.last().unwrap().text.contains("offline"));
    assert_eq!(
        h.transcripts.texts(&NodeRef::agent("b"), Speaker::Assistant),
        vec!["b saw: draft"]
    );
}

#[tokio::test]
async fn cycles_stop_after_each_edge_is_used_once() {
    let mut board = board_with(&[
        (NodeKind::Human, "me"),
        (NodeKind::Agent, "a"),
        (NodeKind::Agent, "b"),
    ]);
    link(&mut board, (NodeKind::Human, "me", "r"), (NodeKind::Agent, "a", "l"));
    link(&mut board, (NodeKind::Agent, "a", "r"), (NodeKind::Agent, "b", "l"));
    link(&mut board, (NodeKind::Agent, "b", "b"), (NodeKind::Agent, "a", "b"));
    assert!(board.graph().has_feedback_loop());
    let h = Harness::new(board, ScriptedBackend::default());

    h.router.fan_out(&NodeRef::human("me"), Message::new("me", "ping")).await;
    h.router.wait_idle().await;

    let agents: Vec<String> = h.backend.calls().into_iter().map(|(a, _)| a).collect();
    assert_eq!(agents, vec!["a", "b"]);
    // no second turn for a
    assert_eq!(h.transcripts.texts(&NodeRef::agent("a"), Speaker::Assistant).len(), 1);
}

#[tokio::test]
async fn a_reply_never_retriggers_the_agent_that_started_the_pass() {
    let mut board = board_with(&[(NodeKind::Agent, "a"), (NodeKind::Agent, "b")]);
    link(&mut board, (NodeKind::Agent, "a", "r"), (NodeKind::Agent, "b", "l"));
    link(&mut board, (NodeKind::Agent, "b", "r"), (NodeKind::Agent, "a", "l"));
    let h = Harness::new(board, ScriptedBackend::default());

    let report = h.router.fan_out(&NodeRef::agent("a"), Message::new("a", "P")).await;
    assert_eq!(report.dispatches[0].outcome, DispatchOutcome::TurnStarted);
    h.router.wait_idle().await;

    let agents: Vec<String> = h.backend.calls().into_iter().map(|(a, _)| a).collect();
    assert_eq!(agents, vec!["b"]);
    assert!(h.transcripts.entries(&NodeRef::agent("a")).is_empty());
}

#[tokio::test]
async fn parallel_connections_each_deliver() {
    let mut board = board_with(&[(NodeKind::Agent, "a"), (NodeKind::Agent, "b")]);
    link(&mut board, (NodeKind::Agent, "a", "r"), (NodeKind::Agent, "b", "l"));
    link(&mut board, (NodeKind::Agent, "a", "b"), (NodeKind::Agent, "b", "t"));
    let h = Harness::new(board, ScriptedBackend::default());

    let report = h.router.fan_out(&NodeRef::agent("a"), Message::new("a", "twice")).await;
    assert_eq!(report.dispatches.len(), 2);
    h.router.wait_idle().await;
    assert_eq!(h.backend.calls_for("b"), 2);
}

#[tokio::test]
async fn replies_over_removed_connections_are_discarded() {
    let mut board = board_with(&[
        (NodeKind::Human, "me"),
        (NodeKind::Agent, "a"),
        (NodeKind::Human, "c"),
    ]);
    let to_a = link(&mut board, (NodeKind::Human, "me", "r"), (NodeKind::Agent, "a", "l"));
    link(&mut board, (NodeKind::Agent, "a", "r"), (NodeKind::Human, "c", "l"));
    let (backend, hold_a) = ScriptedBackend::holding("a");
    let h = Harness::new(board, backend);

    h.router.fan_out(&NodeRef::human("me"), Message::new("me", "late")).await;
    tokio::task::yield_now().await;
    assert!(h.board.write().await.disconnect(&to_a).is_some());
    hold_a.notify_one();
    h.router.wait_idle().await;

    assert_eq!(h.backend.calls_for("a"), 1);
    let a = h.transcripts.entries(&NodeRef::agent("a"));
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].speaker, Speaker::User);
    assert!(h.transcripts.entries(&NodeRef::human("c")).is_empty());
}

#[tokio::test]
async fn hubs_take_nothing_but_the_edge_remembers_the_payload() {
    let mut board = board_with(&[(NodeKind::Agent, "a")]);
    board.add_node(NodeKind::SinkHub, "web", &["l"]).unwrap();
    let to_hub = link(&mut board, (NodeKind::Agent, "a", "t"), (NodeKind::SinkHub, "web", "l"));
    let h = Harness::new(board, ScriptedBackend::default());

    let report = h.router.fan_out(&NodeRef::agent("a"), Message::new("a", "search this")).await;
    assert_eq!(report.dispatches[0].outcome, DispatchOutcome::Ignored);
    assert!(h.transcripts.entries(&NodeRef::hub("web")).is_empty());

    let board = h.board.read().await;
    let payload = board.graph().get(&to_hub).unwrap().last_payload.clone().unwrap();
    assert_eq!(payload.text(), "search this");
    assert!(board.has_web_access(&NodeRef::agent("a")));
}

#[tokio::test]
async fn direct_input_to_a_human_is_kept_and_fanned_out() {
    let mut board = board_with(&[(NodeKind::Human, "me"), (NodeKind::Agent, "a")]);
    link(&mut board, (NodeKind::Human, "me", "r"), (NodeKind::Agent, "a", "l"));
    link(&mut board, (NodeKind::Agent, "a", "r"), (NodeKind::Human, "me", "l"));
    let h = Harness::new(board, ScriptedBackend::default());

    let report = h.router.deliver_to(&NodeRef::human("me"), Message::new("me", "hi")).await;
    assert_eq!(report.targets(), vec![NodeRef::human("me"), NodeRef::agent("a")]);
    h.router.wait_idle().await;

    let me = NodeRef::human("me");
    assert_eq!(h.transcripts.texts(&me, Speaker::User), vec!["hi"]);
    assert_eq!(h.transcripts.texts(&me, Speaker::Assistant), vec!["a saw: hi"]);
}

#[tokio::test]
async fn direct_input_to_unknown_node_fails() {
    let h = Harness::new(board_with(&[]), ScriptedBackend::default());
    let report = h.router.deliver_to(&NodeRef::agent("nobody"), Message::new("me", "hi")).await;
    assert_eq!(report.failures().len(), 1);
    h.router.wait_idle().await;
    assert!(h.backend.calls().is_empty());
}
