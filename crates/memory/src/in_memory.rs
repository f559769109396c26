//! In-memory backend: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use membase_core::error::StoreError;
use membase_core::message::{Message, Tier};
use membase_core::store::{InsertOutcome, MessageBackend, RecordKey, StoredRecord, stamp};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    /// Each stream is kept in ascending index order.
    streams: BTreeMap<(String, Tier), Vec<Slot>>,
    /// message id -> where it lives
    ids: HashMap<String, RecordKey>,
    next_seq: u64,
}

struct Slot {
    /// Global insertion order, for `pending_uploads`
    seq: u64,
    record: StoredRecord,
}

impl Inner {
    fn find(&self, key: &RecordKey) -> Option<&StoredRecord> {
        self.streams
            .get(&(key.conversation_id.clone(), key.tier))?
            .iter()
            .find(|slot| slot.record.memory_index == key.memory_index)
            .map(|slot| &slot.record)
    }

    fn forget(&mut self, removed: &[Slot]) {
        for slot in removed {
            self.ids.remove(&slot.record.message.id);
        }
    }
}

/// A backend that keeps every stream in a map behind one lock.
/// Useful for testing and sessions where persistence isn't needed.
#[derive(Default)]
pub struct InMemoryBackend {
    inner: RwLock<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn insert(
        &self,
        conversation_id: &str,
        tier: Tier,
        mut message: Message,
    ) -> Result<InsertOutcome, StoreError> {
        message.validate()?;
        let mut inner = self.inner.write().await;

        if let Some(key) = inner.ids.get(&message.id)
            && let Some(record) = inner.find(key)
        {
            return Ok(InsertOutcome::Existing(record.clone()));
        }

        let stream_key = (conversation_id.to_string(), tier);
        let memory_index = inner
            .streams
            .get(&stream_key)
            .and_then(|stream| stream.last())
            .map_or(0, |slot| slot.record.memory_index + 1);

        stamp(&mut message, conversation_id, tier, memory_index);
        let record = StoredRecord {
            message,
            conversation_id: conversation_id.to_string(),
            tier,
            memory_index,
            uploaded: false,
            created_at: Utc::now(),
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ids.insert(record.message.id.clone(), record.key());
        inner.streams.entry(stream_key).or_default().push(Slot {
            seq,
            record: record.clone(),
        });

        Ok(InsertOutcome::Inserted(record))
    }

    async fn fetch(
        &self,
        conversation_id: &str,
        tier: Tier,
        recent_n: Option<usize>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        let Some(stream) = inner.streams.get(&(conversation_id.to_string(), tier)) else {
            return Ok(Vec::new());
        };
        let skip = recent_n.map_or(0, |n| stream.len().saturating_sub(n));
        Ok(stream.iter().skip(skip).map(|slot| slot.record.clone()).collect())
    }

    async fn fetch_range(
        &self,
        conversation_id: &str,
        tier: Tier,
        start: u64,
        end: u64,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(&(conversation_id.to_string(), tier))
            .map(|stream| {
                stream
                    .iter()
                    .filter(|slot| (start..=end).contains(&slot.record.memory_index))
                    .map(|slot| slot.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(
        &self,
        conversation_id: &str,
        tier: Tier,
        indices: &[u64],
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(stream) = inner.streams.get_mut(&(conversation_id.to_string(), tier)) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<Slot>, Vec<Slot>) = std::mem::take(stream)
            .into_iter()
            .partition(|slot| indices.contains(&slot.record.memory_index));
        *stream = kept;
        inner.forget(&removed);
        Ok(removed.len())
    }

    async fn clear(&self, conversation_id: &str, tier: Option<Tier>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let tiers = match tier {
            Some(tier) => vec![tier],
            None => Tier::ALL.to_vec(),
        };
        let mut count = 0;
        for tier in tiers {
            if let Some(removed) = inner.streams.remove(&(conversation_id.to_string(), tier)) {
                count += removed.len();
                inner.forget(&removed);
            }
        }
        Ok(count)
    }

    async fn count(&self, conversation_id: &str, tier: Tier) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(&(conversation_id.to_string(), tier))
            .map_or(0, Vec::len))
    }

    async fn last_index(
        &self,
        conversation_id: &str,
        tier: Tier,
    ) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(&(conversation_id.to_string(), tier))
            .and_then(|stream| stream.last())
            .map(|slot| slot.record.memory_index))
    }

    async fn conversations(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .streams
            .iter()
            .filter(|(_, stream)| !stream.is_empty())
            .map(|((conversation_id, _), _)| conversation_id.clone())
            .collect();
        ids.dedup();
        Ok(ids)
    }

    async fn mark_uploaded(&self, message_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(key) = inner.ids.get(message_id).cloned() else {
            return Ok(false);
        };
        let slot = inner
            .streams
            .get_mut(&(key.conversation_id, key.tier))
            .and_then(|stream| {
                stream
                    .iter_mut()
                    .find(|slot| slot.record.message.id == message_id)
            });
        Ok(match slot {
            Some(slot) => {
                slot.record.uploaded = true;
                true
            }
            None => false,
        })
    }

    async fn pending_uploads(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut pending: Vec<&Slot> = inner
            .streams
            .values()
            .flatten()
            .filter(|slot| !slot.record.uploaded)
            .collect();
        pending.sort_by_key(|slot| slot.seq);
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|slot| slot.record.clone())
            .collect())
    }
}
