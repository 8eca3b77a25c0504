use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("agent {agent} is unreachable: {reason}")]
    Unreachable { agent: String, reason: String },
    #[error("agent {agent} refused the turn: {reason}")]
    Refused { agent: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SectionError {
    #[error("document section {0} does not exist")]
    UnknownSection(String),
    #[error("could not append to section {section}: {reason}")]
    Write { section: String, reason: String },
}

/// Produces one reply per inbound message for an agent node.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn send_turn(&self, node_id: &str, message: &Message) -> Result<Message, BackendError>;
}

/// Destination for text routed into document sections.
pub trait SectionSink: Send + Sync {
    fn append_to_section(&self, section_id: &str, message: &Message) -> Result<(), SectionError>;
}

/// Replies with the inbound text, prefixed with the agent id.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

#[async_trait]
impl AgentBackend for EchoAgent {
    async fn send_turn(&self, node_id: &str, message: &Message) -> Result<Message, BackendError> {
        Ok(Message::new(node_id, &format!("[{node_id}] {}", message.text())))
    }
}

/// Sections kept in memory. Appending to an unknown section creates it.
#[derive(Debug, Clone, Default)]
pub struct InMemorySections {
    sections: Arc<DashMap<String, Vec<String>>>,
}

impl InMemorySections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self, section_id: &str) -> Option<String> {
        self.sections.get(section_id).map(|s| s.join("\n\n"))
    }

    pub fn section_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl SectionSink for InMemorySections {
    fn append_to_section(&self, section_id: &str, message: &Message) -> Result<(), SectionError> {
        self.sections
            .entry(section_id.to_string())
            .or_default()
            .push(message.text().to_string());
        Ok(())
    }
}
