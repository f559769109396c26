//! In-memory knowledge index with keyword scoring.

use async_trait::async_trait;
use membase_core::error::KnowledgeError;
use membase_core::knowledge::{Document, KnowledgeIndex, ScoredDocument};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps documents in a map and scores them by query-term occurrences.
/// Useful for tests and offline sessions.
#[derive(Default)]
pub struct InMemoryKnowledgeIndex {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryKnowledgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl KnowledgeIndex for InMemoryKnowledgeIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn exists(&self, id: &str) -> Result<bool, KnowledgeError> {
        Ok(self.documents.read().await.contains_key(id))
    }

    async fn add_document(&self, document: Document) -> Result<(), KnowledgeError> {
        if document.id.trim().is_empty() {
            return Err(KnowledgeError::Rejected("document id is empty".into()));
        }
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
        Ok(())
    }

    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredDocument>, KnowledgeError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.documents.read().await;
        let mut results: Vec<ScoredDocument> = documents
            .values()
            .filter_map(|doc| {
                let doc_terms = terms(&doc.content);
                let occurrences = doc_terms
                    .iter()
                    .filter(|t| query_terms.contains(t))
                    .count();
                if occurrences == 0 {
                    return None;
                }
                // Short documents with the same hits rank higher.
                let score = occurrences as f32 / (doc_terms.len() as f32 / 10.0).max(1.0);
                Some(ScoredDocument {
                    document: doc.clone(),
                    score,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        results.truncate(limit);
        Ok(results)
    }
}
