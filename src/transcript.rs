use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::{connection::ConnectionId, message::Message, node::NodeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub author: String,
    pub text: String,
    pub at: DateTime<Utc>,
    /// Connection the entry arrived over; `None` for direct input.
    pub via: Option<ConnectionId>,
}

impl TranscriptEntry {
    pub fn from_message(speaker: Speaker, message: &Message, via: Option<ConnectionId>) -> Self {
        Self {
            speaker,
            author: message.author().to_string(),
            text: message.text().to_string(),
            at: Utc::now(),
            via,
        }
    }

    pub fn failure(node: &NodeRef, error: &str, via: Option<ConnectionId>) -> Self {
        Self {
            speaker: Speaker::Error,
            author: node.id.clone(),
            text: error.to_string(),
            at: Utc::now(),
            via,
        }
    }
}

/// Per-node conversation history. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    entries: Arc<DashMap<NodeRef, Vec<TranscriptEntry>>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, node: &NodeRef, entry: TranscriptEntry) {
        self.entries.entry(node.clone()).or_default().push(entry);
    }

    pub fn entries(&self, node: &NodeRef) -> Vec<TranscriptEntry> {
        self.entries
            .get(node)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn texts(&self, node: &NodeRef, speaker: Speaker) -> Vec<String> {
        self.entries(node)
            .into_iter()
            .filter(|e| e.speaker == speaker)
            .map(|e| e.text)
            .collect()
    }

    pub fn nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self.entries.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn clear(&self, node: &NodeRef) {
        self.entries.remove(node);
    }
}
