use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A chat payload travelling along connections.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    id: String,
    author: String,
    text: String,
    sent_at: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(author: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            author: author.to_string(),
            text: text.to_string(),
            sent_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(id: &str, author: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::new(author, text)
        }
    }

    pub fn from_error(error: String) -> Self {
        let mut msg = Self::new("system", &error);
        msg.add("error".to_string(), error);
        msg
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn is_error(&self) -> bool {
        self.metadata.contains_key("error")
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.metadata.get(name)
    }

    pub fn add(&mut self, name: String, value: String) {
        self.metadata.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.metadata.remove(name);
    }
}
