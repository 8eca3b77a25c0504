use std::sync::Arc;

use nodeboard::backend::{EchoAgent, InMemorySections};
use nodeboard::board::Board;
use nodeboard::identity::PointMeta;
use nodeboard::message::Message;
use nodeboard::node::{NodeKind, NodeRef};
use nodeboard::runtime::{BoardRuntime, Submission};
use nodeboard::storage::Storage;
use nodeboard::transcript::Speaker;

const SIDES: [&str; 4] = ["t", "r", "b", "l"];

/// human:me -> agent:a
fn runtime_on(storage: Storage) -> BoardRuntime {
    let mut board = Board::new(storage.clone());
    board.add_node(NodeKind::Human, "me", &SIDES).unwrap();
    board.add_node(NodeKind::Agent, "a", &SIDES).unwrap();
    board
        .connect(
            &PointMeta::on(NodeKind::Human, "me", "r"),
            &PointMeta::on(NodeKind::Agent, "a", "l"),
        )
        .unwrap();
    BoardRuntime::new(board, storage, Arc::new(EchoAgent), Arc::new(InMemorySections::new()))
}

#[tokio::test]
async fn running_flow_delivers_immediately() {
    let rt = runtime_on(Storage::in_memory());
    let submission = rt.submit(&NodeRef::agent("a"), Message::new("me", "now")).await;
    assert!(matches!(submission, Submission::Delivered(_)));
    rt.wait_idle().await;
    assert_eq!(
        rt.transcripts().texts(&NodeRef::agent("a"), Speaker::Assistant),
        vec!["[a] now"]
    );
}

#[tokio::test]
async fn paused_flow_queues_and_replays_in_order() {
    let rt = runtime_on(Storage::in_memory());
    let (a, me) = (NodeRef::agent("a"), NodeRef::human("me"));
    assert!(rt.pause().await);

    assert_eq!(rt.submit(&a, Message::new("me", "1")).await, Submission::Queued(0));
    assert_eq!(rt.submit(&a, Message::new("me", "2")).await, Submission::Queued(1));
    assert_eq!(rt.submit(&me, Message::new("me", "3")).await, Submission::Queued(2));
    rt.wait_idle().await;
    assert!(rt.transcripts().entries(&a).is_empty());
    let stats = rt.queue_stats().await;
    assert_eq!((stats.length, stats.destinations), (3, 2));

    assert_eq!(rt.resume().await, 3);
    rt.wait_idle().await;
    assert!(!rt.is_paused().await);
    assert_eq!(rt.transcripts().texts(&a, Speaker::User), vec!["1", "2", "3"]);
    assert_eq!(rt.transcripts().texts(&me, Speaker::User), vec!["3"]);
    assert_eq!(rt.queue_stats().await.length, 0);
}

#[tokio::test]
async fn pause_survives_restart() {
    let storage = Storage::in_memory();
    let rt = runtime_on(storage.clone());
    rt.pause().await;
    drop(rt);

    let rt = BoardRuntime::new(
        Board::new(storage.clone()),
        storage,
        Arc::new(EchoAgent),
        Arc::new(InMemorySections::new()),
    );
    assert!(rt.is_paused().await);
    rt.board().write().await.restore();
    let queued = rt.submit(&NodeRef::agent("a"), Message::new("me", "held")).await;
    assert_eq!(queued, Submission::Queued(0));
}

#[tokio::test]
async fn removing_a_node_drops_its_queue_and_transcript() {
    let rt = runtime_on(Storage::in_memory());
    let a = NodeRef::agent("a");
    rt.submit(&a, Message::new("me", "before")).await;
    rt.wait_idle().await;
    assert!(!rt.transcripts().entries(&a).is_empty());

    rt.pause().await;
    rt.submit(&a, Message::new("me", "pending")).await;
    let removed = rt.remove_node(&a).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(rt.transcripts().entries(&a).is_empty());
    assert_eq!(rt.queue_stats().await.length, 0);
    assert_eq!(rt.resume().await, 0);
}

#[tokio::test]
async fn toggle_switches_between_states() {
    let rt = runtime_on(Storage::in_memory());
    assert!(rt.toggle().await);
    assert!(rt.is_paused().await);
    rt.submit(&NodeRef::human("me"), Message::new("me", "queued")).await;
    assert!(!rt.toggle().await);
    rt.wait_idle().await;
    assert_eq!(
        rt.transcripts().texts(&NodeRef::agent("a"), Speaker::User),
        vec!["queued"]
    );
}
