//! The message store: the front every caller writes through.
//!
//! Wraps a [`MessageBackend`] and adds the side effects of a committed
//! write: the knowledge-index existence check and the hub upload.

use membase_core::error::StoreError;
use membase_core::hub::{UploadRequest, hub_object_id, resolve_bucket};
use membase_core::knowledge::{Document, KnowledgeIndex, ScoredDocument};
use membase_core::message::{Message, Tier};
use membase_core::store::{MessageBackend, StoredRecord};
use membase_core::wire;
use membase_hub::{SyncItem, SyncQueue};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::noop::NoopKnowledgeIndex;

/// Per-account message store.
pub struct MessageStore {
    account: String,
    backend: Arc<dyn MessageBackend>,
    knowledge: Arc<dyn KnowledgeIndex>,
    sync: Option<SyncQueue>,
    /// Bucket override applied when a message has no name
    hub_id: Option<String>,
    /// Conversations written or read through this instance
    seen: Mutex<BTreeSet<String>>,
}

impl MessageStore {
    pub fn new(account: impl Into<String>, backend: Arc<dyn MessageBackend>) -> Self {
        Self {
            account: account.into(),
            backend,
            knowledge: Arc::new(NoopKnowledgeIndex),
            sync: None,
            hub_id: None,
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeIndex>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Mirror every committed write through `queue`.
    pub fn with_sync(mut self, queue: SyncQueue, hub_id: Option<String>) -> Self {
        self.sync = Some(queue);
        self.hub_id = hub_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn backend(&self) -> &Arc<dyn MessageBackend> {
        &self.backend
    }

    pub fn sync_queue(&self) -> Option<&SyncQueue> {
        self.sync.as_ref()
    }

    /// Commit `message` to the end of the (conversation, tier) stream.
    ///
    /// Returns the committed message with its index and metadata filled in.
    /// A message whose id is already stored comes back unchanged.
    pub async fn add(
        &self,
        conversation_id: &str,
        tier: Tier,
        message: Message,
    ) -> Result<Message, StoreError> {
        self.commit(conversation_id, tier, message, true).await
    }

    /// Commit without mirroring; used for records that came from the hub.
    pub async fn add_local(
        &self,
        conversation_id: &str,
        tier: Tier,
        message: Message,
    ) -> Result<Message, StoreError> {
        self.commit(conversation_id, tier, message, false).await
    }

    /// Add several messages in order, each to the tier it declares.
    pub async fn add_batch(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut committed = Vec::with_capacity(messages.len());
        for message in messages {
            let tier = message.tier;
            committed.push(self.add(conversation_id, tier, message).await?);
        }
        Ok(committed)
    }

    async fn commit(
        &self,
        conversation_id: &str,
        tier: Tier,
        message: Message,
        mirror: bool,
    ) -> Result<Message, StoreError> {
        if conversation_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("conversation id is empty".into()));
        }

        let outcome = self.backend.insert(conversation_id, tier, message).await?;
        self.remember(conversation_id);
        if !outcome.is_new() {
            debug!(
                conversation_id,
                id = %outcome.record().message.id,
                "Message already stored"
            );
            return Ok(outcome.into_record().message);
        }

        let record = outcome.into_record();
        self.index_knowledge(&record.message).await;
        if mirror {
            self.mirror(&record).await;
        }
        Ok(record.message)
    }

    async fn index_knowledge(&self, message: &Message) {
        match self.knowledge.exists(&message.id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self
                    .knowledge
                    .add_document(Document::from_message(message))
                    .await
                {
                    warn!(id = %message.id, error = %e, "Knowledge index rejected message");
                }
            }
            Err(e) => warn!(id = %message.id, error = %e, "Knowledge index unavailable"),
        }
    }

    async fn mirror(&self, record: &StoredRecord) {
        let Some(queue) = &self.sync else {
            return;
        };

        let payload = match wire::encode(&record.message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %record.message.id, error = %e, "Cannot encode message for upload");
                return;
            }
        };
        let item = SyncItem {
            request: UploadRequest {
                owner: self.account.clone(),
                bucket: resolve_bucket(
                    Some(&record.message.name),
                    self.hub_id.as_deref(),
                    &self.account,
                ),
                id: hub_object_id(&record.conversation_id, record.tier, record.memory_index),
                message: payload,
            },
            message_id: Some(record.message.id.clone()),
        };

        if let Err(e) = queue.enqueue(item, false).await {
            warn!(conversation_id = %record.conversation_id, error = %e, "Upload not queued");
        }
    }

    /// Messages of one tier, oldest first; `recent_n` keeps the last N.
    pub async fn get(
        &self,
        conversation_id: &str,
        tier: Tier,
        recent_n: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        self.get_filtered(conversation_id, tier, recent_n, |_, _| true)
            .await
    }

    /// Like [`get`](Self::get), then keep messages for which
    /// `predicate(position, message)` holds. `position` counts from 0 over
    /// the list before filtering.
    pub async fn get_filtered<F>(
        &self,
        conversation_id: &str,
        tier: Tier,
        recent_n: Option<usize>,
        predicate: F,
    ) -> Result<Vec<Message>, StoreError>
    where
        F: Fn(usize, &Message) -> bool + Send,
    {
        let records = self.backend.fetch(conversation_id, tier, recent_n).await?;
        Ok(records
            .into_iter()
            .enumerate()
            .filter(|(position, record)| predicate(*position, &record.message))
            .map(|(_, record)| record.message)
            .collect())
    }

    /// Messages whose index lies in `start..=end`, oldest first.
    pub async fn get_range(
        &self,
        conversation_id: &str,
        tier: Tier,
        start: u64,
        end: u64,
    ) -> Result<Vec<Message>, StoreError> {
        let records = self
            .backend
            .fetch_range(conversation_id, tier, start, end)
            .await?;
        Ok(records.into_iter().map(|record| record.message).collect())
    }

    /// Remove the messages with these indices; the rest keep theirs.
    pub async fn delete(
        &self,
        conversation_id: &str,
        tier: Tier,
        indices: &[u64],
    ) -> Result<usize, StoreError> {
        let removed = self.backend.delete(conversation_id, tier, indices).await?;
        debug!(conversation_id, tier = %tier, removed, "Deleted messages");
        Ok(removed)
    }

    /// Remove one tier, or every tier when `tier` is `None`.
    pub async fn clear(
        &self,
        conversation_id: &str,
        tier: Option<Tier>,
    ) -> Result<usize, StoreError> {
        let removed = self.backend.clear(conversation_id, tier).await?;
        debug!(conversation_id, removed, "Cleared conversation");
        Ok(removed)
    }

    pub async fn size(&self, conversation_id: &str, tier: Tier) -> Result<usize, StoreError> {
        self.backend.count(conversation_id, tier).await
    }

    pub async fn last_index(
        &self,
        conversation_id: &str,
        tier: Tier,
    ) -> Result<Option<u64>, StoreError> {
        self.backend.last_index(conversation_id, tier).await
    }

    /// Persisted conversations plus every conversation touched through this instance.
    pub async fn list_conversations(&self) -> Result<Vec<String>, StoreError> {
        let mut all: BTreeSet<String> = self.backend.conversations().await?.into_iter().collect();
        all.extend(self.seen_snapshot());
        Ok(all.into_iter().collect())
    }

    /// Records the hub has not acknowledged yet.
    pub async fn pending_uploads(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        self.backend.pending_uploads(limit).await
    }

    /// The tier as a JSON array of tagged messages.
    pub async fn export(&self, conversation_id: &str, tier: Tier) -> Result<String, StoreError> {
        let messages = self.get(conversation_id, tier, None).await?;
        wire::encode_all(&messages)
    }

    /// Decode a JSON array of messages and add them without mirroring.
    /// With `overwrite`, the conversation is cleared first.
    pub async fn import(
        &self,
        conversation_id: &str,
        json: &str,
        overwrite: bool,
    ) -> Result<usize, StoreError> {
        let messages = wire::decode_all(json)?;
        if overwrite {
            self.clear(conversation_id, None).await?;
        }
        let mut added = 0;
        for message in messages {
            let tier = message.tier;
            self.add_local(conversation_id, tier, message).await?;
            added += 1;
        }
        Ok(added)
    }

    /// Ask the knowledge index for related documents.
    pub async fn retrieve(&self, query: &str, limit: usize) -> Vec<ScoredDocument> {
        match self.knowledge.retrieve(query, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Knowledge retrieval failed");
                Vec::new()
            }
        }
    }

    fn remember(&self, conversation_id: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(conversation_id.to_string());
        }
    }

    fn seen_snapshot(&self) -> Vec<String> {
        self.seen
            .lock()
            .map(|seen| seen.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryBackend;
    use crate::knowledge::InMemoryKnowledgeIndex;
    use crate::sqlite::SqliteBackend;
    use async_trait::async_trait;
    use membase_core::error::{HubError, KnowledgeError};
    use membase_core::hub::HubTransport;

    fn store() -> MessageStore {
        MessageStore::new("alice", Arc::new(InMemoryBackend::new()))
    }

    #[derive(Default)]
    struct RecordingHub {
        uploads: Mutex<Vec<UploadRequest>>,
        delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl HubTransport for RecordingHub {
        fn name(&self) -> &str {
            "recording"
        }

        async fn upload(&self, request: &UploadRequest) -> Result<(), HubError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.uploads.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn list_conversations(&self, _owner: &str) -> Result<Vec<String>, HubError> {
            Ok(vec![])
        }

        async fn get_conversation(&self, _owner: &str, _id: &str) -> Result<Vec<String>, HubError> {
            Ok(vec![])
        }

        async fn download(&self, _owner: &str, _id: &str) -> Result<Vec<u8>, HubError> {
            Ok(vec![])
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl KnowledgeIndex for BrokenIndex {
        fn name(&self) -> &str {
            "broken"
        }

        async fn exists(&self, _id: &str) -> Result<bool, KnowledgeError> {
            Err(KnowledgeError::Unavailable("down".into()))
        }

        async fn add_document(&self, _document: Document) -> Result<(), KnowledgeError> {
            Err(KnowledgeError::Unavailable("down".into()))
        }

        async fn retrieve(
            &self,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<ScoredDocument>, KnowledgeError> {
            Err(KnowledgeError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn add_assigns_index_and_metadata() {
        let store = store();
        let first = store
            .add("chat", Tier::Stm, Message::user("alice", "hi"))
            .await
            .unwrap();
        let second = store
            .add("chat", Tier::Stm, Message::assistant("bot", "hello"))
            .await
            .unwrap();
        assert_eq!(first.memory_index(), Some(0));
        assert_eq!(second.memory_index(), Some(1));
        assert_eq!(second.conversation_id(), Some("chat"));
        assert_eq!(store.size("chat", Tier::Stm).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_conversation_id_is_invalid() {
        let store = store();
        let err = store
            .add(" ", Tier::Stm, Message::user("alice", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn get_recent_and_all() {
        let store = store();
        for i in 0..5 {
            store
                .add("chat", Tier::Stm, Message::user("alice", format!("m{i}")))
                .await
                .unwrap();
        }

        let all = store.get("chat", Tier::Stm, None).await.unwrap();
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

        let recent = store.get("chat", Tier::Stm, Some(2)).await.unwrap();
        assert_eq!(recent[0].content, "m3");
        assert_eq!(recent[1].content, "m4");

        let empty = store.get("chat", Tier::Ltm, Some(1)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn predicate_sees_positions_after_recent_n() {
        let store = store();
        for i in 0..6 {
            store
                .add("chat", Tier::Stm, Message::user("alice", format!("m{i}")))
                .await
                .unwrap();
        }
        store.delete("chat", Tier::Stm, &[0]).await.unwrap();

        // Remaining indices 1..=5; the last 4 are 2..=5 at positions 0..=3.
        let even_positions = store
            .get_filtered("chat", Tier::Stm, Some(4), |pos, _| pos % 2 == 0)
            .await
            .unwrap();
        let indices: Vec<u64> = even_positions.iter().filter_map(Message::memory_index).collect();
        assert_eq!(indices, vec![2, 4]);

        let by_index = store
            .get_filtered("chat", Tier::Stm, None, |_, m| {
                m.memory_index().is_some_and(|i| (3..=4).contains(&i))
            })
            .await
            .unwrap();
        assert_eq!(by_index.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_id_is_returned_unchanged() {
        let store = store();
        let msg = Message::user("alice", "same");
        let first = store.add("chat", Tier::Stm, msg.clone()).await.unwrap();
        let again = store.add("chat", Tier::Stm, msg).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.size("chat", Tier::Stm).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn committed_messages_are_indexed_once() {
        let index = Arc::new(InMemoryKnowledgeIndex::new());
        let store = store().with_knowledge(index.clone());
        let msg = Message::user("alice", "the borrow checker");
        store.add("chat", Tier::Stm, msg.clone()).await.unwrap();
        store.add("chat", Tier::Stm, msg).await.unwrap();
        assert_eq!(index.len().await, 1);

        let hits = store.retrieve("borrow", 5).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn knowledge_failure_does_not_fail_add() {
        let store = store().with_knowledge(Arc::new(BrokenIndex));
        let msg = store
            .add("chat", Tier::Stm, Message::user("alice", "hi"))
            .await
            .unwrap();
        assert_eq!(msg.memory_index(), Some(0));
        assert!(store.retrieve("hi", 5).await.is_empty());
    }

    #[tokio::test]
    async fn writes_are_mirrored_with_hub_ids() {
        let backend: Arc<dyn MessageBackend> = Arc::new(InMemoryBackend::new());
        let hub = Arc::new(RecordingHub::default());
        let queue = SyncQueue::start(hub.clone(), Some(backend.clone()));
        let store =
            MessageStore::new("alice", backend).with_sync(queue.clone(), Some("hub-7".into()));

        store
            .add("chat", Tier::Stm, Message::user("", "no name"))
            .await
            .unwrap();
        store
            .add("chat", Tier::Ltm, Message::assistant("summarizer", "summary"))
            .await
            .unwrap();
        store
            .add_local("chat", Tier::Stm, Message::user("alice", "from hub"))
            .await
            .unwrap();
        queue.flush().await.unwrap();

        let uploads = hub.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].id, "chat_0");
        assert_eq!(uploads[0].bucket, "hub-7");
        assert_eq!(uploads[1].id, "ltm_chat_0");
        assert_eq!(uploads[1].bucket, "summarizer");
        assert_eq!(wire::decode(&uploads[1].message).unwrap().content, "summary");

        // Only the mirror-less record is still pending.
        let pending = store.pending_uploads(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.content, "from hub");
    }

    #[tokio::test]
    async fn late_ack_does_not_mark_record_that_reused_the_index() {
        let backend: Arc<dyn MessageBackend> =
            Arc::new(SqliteBackend::new("sqlite::memory:").await.unwrap());
        let hub = Arc::new(RecordingHub {
            delay: Some(std::time::Duration::from_millis(200)),
            ..Default::default()
        });
        let queue = SyncQueue::start(hub.clone(), Some(backend.clone()));
        let store = MessageStore::new("alice", backend).with_sync(queue.clone(), None);

        store
            .add("chat", Tier::Stm, Message::user("alice", "old"))
            .await
            .unwrap();
        store.clear("chat", None).await.unwrap();
        let new = store
            .add_local("chat", Tier::Stm, Message::user("alice", "new"))
            .await
            .unwrap();
        assert_eq!(new.memory_index(), Some(0));
        queue.flush().await.unwrap();

        assert_eq!(hub.uploads.lock().unwrap()[0].id, "chat_0");
        let pending = store.pending_uploads(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.content, "new");
    }

    #[tokio::test]
    async fn get_range_reads_only_the_window() {
        let store = store();
        for i in 0..6 {
            store
                .add("chat", Tier::Stm, Message::user("alice", format!("m{i}")))
                .await
                .unwrap();
        }
        let window = store.get_range("chat", Tier::Stm, 2, 4).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn list_conversations_includes_derived_ids() {
        let store = store();
        store
            .add("chat", Tier::Stm, Message::user("alice", "hi"))
            .await
            .unwrap();
        store
            .add("membase_profile_alice", Tier::Profile, Message::assistant("p", "{}"))
            .await
            .unwrap();
        assert_eq!(
            store.list_conversations().await.unwrap(),
            vec!["chat".to_string(), "membase_profile_alice".to_string()]
        );
    }

    #[tokio::test]
    async fn export_then_import_into_fresh_store() {
        let source = store();
        source
            .add("chat", Tier::Stm, Message::user("alice", "one"))
            .await
            .unwrap();
        source
            .add("chat", Tier::Stm, Message::user("alice", "two"))
            .await
            .unwrap();
        let json = source.export("chat", Tier::Stm).await.unwrap();

        let backend = SqliteBackend::new("sqlite::memory:").await.unwrap();
        let target = MessageStore::new("alice", Arc::new(backend));
        target
            .add("chat", Tier::Stm, Message::user("alice", "stale"))
            .await
            .unwrap();
        assert_eq!(target.import("chat", &json, true).await.unwrap(), 2);

        let messages = target.get("chat", Tier::Stm, None).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn import_rejects_unknown_kinds() {
        let store = store();
        let json = r#"[{"__module__":"os","__name__":"system","id":"x","name":"y"}]"#;
        assert!(matches!(
            store.import("chat", json, false).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert_eq!(store.size("chat", Tier::Stm).await.unwrap(), 0);
    }
}
