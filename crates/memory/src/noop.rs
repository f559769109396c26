//! No-op knowledge index: disables retrieval entirely.

use async_trait::async_trait;
use membase_core::error::KnowledgeError;
use membase_core::knowledge::{Document, KnowledgeIndex, ScoredDocument};

/// A knowledge index that stores nothing; every id is reported absent.
pub struct NoopKnowledgeIndex;

#[async_trait]
impl KnowledgeIndex for NoopKnowledgeIndex {
    fn name(&self) -> &str {
        "none"
    }

    async fn exists(&self, _id: &str) -> Result<bool, KnowledgeError> {
        Ok(false)
    }

    async fn add_document(&self, _document: Document) -> Result<(), KnowledgeError> {
        Ok(())
    }

    async fn retrieve(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<ScoredDocument>, KnowledgeError> {
        Ok(Vec::new())
    }
}
