//! Storage backend trait: durable per-(conversation, tier) append logs.
//!
//! A backend owns index assignment: `insert` reads the current maximum
//! index for the key and writes the new record as one atomic unit, so two
//! concurrent inserts on the same key can never observe the same maximum.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::message::{Message, Tier};

/// Identifies one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub conversation_id: String,
    pub tier: Tier,
    pub memory_index: u64,
}

/// A message as persisted, with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// The committed message; its metadata carries conversation, index and tier.
    pub message: Message,
    pub conversation_id: String,
    pub tier: Tier,
    pub memory_index: u64,
    /// Whether the hub has acknowledged this record
    pub uploaded: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            conversation_id: self.conversation_id.clone(),
            tier: self.tier,
            memory_index: self.memory_index,
        }
    }
}

/// What `insert` did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// A fresh index was assigned and the record committed.
    Inserted(StoredRecord),
    /// A record with the same message id already exists; nothing was written.
    Existing(StoredRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &StoredRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> StoredRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Existing(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Stamp the store-owned metadata onto a message about to be committed.
pub fn stamp(message: &mut Message, conversation_id: &str, tier: Tier, memory_index: u64) {
    message.tier = tier;
    message.metadata.conversation = Some(conversation_id.to_string());
    message.metadata.memory_index = Some(memory_index);
    message.metadata.memory_type = Some(tier);
}

/// The persistence contract behind the message store.
///
/// Implementations: SQLite (durable), in-memory (tests, ephemeral sessions).
#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Assign `max(index) + 1` (or 0) for the key and persist the message.
    async fn insert(
        &self,
        conversation_id: &str,
        tier: Tier,
        message: Message,
    ) -> Result<InsertOutcome, StoreError>;

    /// Records of one tier in ascending index order; `recent_n` keeps the last N.
    async fn fetch(
        &self,
        conversation_id: &str,
        tier: Tier,
        recent_n: Option<usize>,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Records whose index lies in `start..=end`, oldest first.
    async fn fetch_range(
        &self,
        conversation_id: &str,
        tier: Tier,
        start: u64,
        end: u64,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Remove the records with these indices. Remaining indices are untouched.
    async fn delete(
        &self,
        conversation_id: &str,
        tier: Tier,
        indices: &[u64],
    ) -> Result<usize, StoreError>;

    /// Remove every record of one tier, or of all tiers when `tier` is `None`.
    async fn clear(&self, conversation_id: &str, tier: Option<Tier>) -> Result<usize, StoreError>;

    async fn count(&self, conversation_id: &str, tier: Tier) -> Result<usize, StoreError>;

    /// Highest committed index for the key, `None` when the tier is empty.
    async fn last_index(&self, conversation_id: &str, tier: Tier)
    -> Result<Option<u64>, StoreError>;

    /// Distinct conversation ids with at least one stored record.
    async fn conversations(&self) -> Result<Vec<String>, StoreError>;

    /// Record that the hub acknowledged the message with this id.
    /// Returns false if it is gone.
    async fn mark_uploaded(&self, message_id: &str) -> Result<bool, StoreError>;

    /// Oldest records not yet acknowledged by the hub.
    async fn pending_uploads(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError>;
}
