//! Knowledge index trait: retrieval side-channel fed by the store.
//!
//! The store only asks whether a message id is already indexed and, if not,
//! adds it. Similarity search itself belongs to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KnowledgeError;
use crate::message::Message;

/// A document handed to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    /// Build the document for a committed message.
    pub fn from_message(message: &Message) -> Self {
        let metadata = match serde_json::to_value(&message.metadata) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            id: message.id.clone(),
            content: message.content.clone(),
            metadata,
        }
    }
}

/// A retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    fn name(&self) -> &str;

    async fn exists(&self, id: &str) -> Result<bool, KnowledgeError>;

    async fn add_document(&self, document: Document) -> Result<(), KnowledgeError>;

    /// Best matches for `query`, highest score first.
    async fn retrieve(&self, query: &str, limit: usize)
    -> Result<Vec<ScoredDocument>, KnowledgeError>;
}
