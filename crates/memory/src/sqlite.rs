//! SQLite message backend.
//!
//! One table, `messages`, holds every tier of every conversation. Index
//! assignment runs under a per-key async lock and inside a
//! `BEGIN IMMEDIATE` transaction, and `UNIQUE(conversation_id, tier,
//! memory_index)` rejects anything that slips past both.

use async_trait::async_trait;
use chrono::Utc;
use membase_core::error::StoreError;
use membase_core::message::{Message, Tier};
use membase_core::store::{InsertOutcome, MessageBackend, StoredRecord, stamp};
use membase_core::wire;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const MAX_INDEX_SQL: &str = r#"
    SELECT MAX(memory_index) AS max_index FROM messages
    WHERE conversation_id = ?1 AND tier = ?2
"#;

/// One async lock per (conversation, tier) write stream.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: Mutex<HashMap<(String, Tier), Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn get(&self, conversation_id: &str, tier: Tier) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry((conversation_id.to_string(), tier))
            .or_default()
            .clone()
    }
}

/// A durable SQLite message backend.
pub struct SqliteBackend {
    pool: SqlitePool,
    locks: KeyLocks,
}

impl SqliteBackend {
    /// Open a backend from a SQLite URL or path.
    ///
    /// The database and its table are created automatically.
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Persistence(format!("Invalid SQLite path: {e}")))?;
        let ephemeral = url.contains(":memory:");
        Self::connect(options, ephemeral, url).await
    }

    /// Open (or create) the database file at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Persistence(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect(options, false, &path.display().to_string()).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        ephemeral: bool,
        label: &str,
    ) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to ":memory:" is its own database, so keep exactly one alive.
        let pool_options = if ephemeral {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Persistence(format!("Failed to open SQLite: {e}")))?;

        let backend = Self {
            pool,
            locks: KeyLocks::default(),
        };
        backend.run_migrations().await?;
        info!("SQLite message backend initialized at {label}");
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id               TEXT PRIMARY KEY NOT NULL,
                conversation_id  TEXT NOT NULL,
                tier             TEXT NOT NULL,
                content          TEXT NOT NULL,
                memory_index     INTEGER NOT NULL,
                upload_status    INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                UNIQUE (conversation_id, tier, memory_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_pending \
             ON messages(upload_status, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("upload_status index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Parse a `StoredRecord` from a SQLite row.
    fn row_to_record(row: &SqliteRow) -> Result<StoredRecord, StoreError> {
        let column =
            |name: &str, e: sqlx::Error| StoreError::Corrupt(format!("{name} column: {e}"));

        let id: String = row.try_get("id").map_err(|e| column("id", e))?;
        let conversation_id: String = row
            .try_get("conversation_id")
            .map_err(|e| column("conversation_id", e))?;
        let tier: String = row.try_get("tier").map_err(|e| column("tier", e))?;
        let content: String = row.try_get("content").map_err(|e| column("content", e))?;
        let memory_index: i64 = row
            .try_get("memory_index")
            .map_err(|e| column("memory_index", e))?;
        let upload_status: i64 = row
            .try_get("upload_status")
            .map_err(|e| column("upload_status", e))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| column("created_at", e))?;

        let tier = Tier::from_str(&tier)
            .map_err(|_| StoreError::Corrupt(format!("record {id} has unknown tier {tier}")))?;
        let message = wire::decode(&content)
            .map_err(|e| StoreError::Corrupt(format!("record {id}: {e}")))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(StoredRecord {
            message,
            conversation_id,
            tier,
            memory_index: memory_index as u64,
            uploaded: upload_status != 0,
            created_at,
        })
    }

    /// Read-max-then-insert. The caller holds the key lock and an open transaction.
    async fn insert_locked(
        conn: &mut SqliteConnection,
        conversation_id: &str,
        tier: Tier,
        mut message: Message,
    ) -> Result<InsertOutcome, StoreError> {
        let existing = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(&message.id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StoreError::Persistence(format!("Lookup by id: {e}")))?;
        if let Some(row) = existing {
            return Ok(InsertOutcome::Existing(Self::row_to_record(&row)?));
        }

        let row = sqlx::query(MAX_INDEX_SQL)
            .bind(conversation_id)
            .bind(tier.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StoreError::Persistence(format!("MAX(memory_index): {e}")))?;
        let max_index: Option<i64> = row
            .try_get("max_index")
            .map_err(|e| StoreError::Persistence(format!("max_index column: {e}")))?;
        let memory_index = max_index.map_or(0, |max| max as u64 + 1);

        stamp(&mut message, conversation_id, tier, memory_index);
        let content = wire::encode(&message)?;
        let created_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, tier, content, memory_index, upload_status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            "#,
        )
        .bind(&message.id)
        .bind(conversation_id)
        .bind(tier.as_str())
        .bind(&content)
        .bind(memory_index as i64)
        .bind(created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::Persistence(format!("INSERT failed: {e}")))?;

        Ok(InsertOutcome::Inserted(StoredRecord {
            message,
            conversation_id: conversation_id.to_string(),
            tier,
            memory_index,
            uploaded: false,
            created_at,
        }))
    }
}

#[async_trait]
impl MessageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert(
        &self,
        conversation_id: &str,
        tier: Tier,
        message: Message,
    ) -> Result<InsertOutcome, StoreError> {
        message.validate()?;

        let lock = self.locks.get(conversation_id, tier);
        let _guard = lock.lock().await;

        // Dropping `tx` before commit rolls back, so a cancelled insert
        // never returns a connection with an open transaction to the pool.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| StoreError::Persistence(format!("BEGIN failed: {e}")))?;

        let outcome = Self::insert_locked(&mut *tx, conversation_id, tier, message).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Persistence(format!("COMMIT failed: {e}")))?;

        if let InsertOutcome::Inserted(record) = &outcome {
            debug!(
                conversation_id,
                tier = %tier,
                memory_index = record.memory_index,
                "Stored message"
            );
        }
        Ok(outcome)
    }

    async fn fetch(
        &self,
        conversation_id: &str,
        tier: Tier,
        recent_n: Option<usize>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        // LIMIT -1 means no limit in SQLite.
        let limit = recent_n.map_or(-1, |n| n as i64);
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages
                WHERE conversation_id = ?1 AND tier = ?2
                ORDER BY memory_index DESC
                LIMIT ?3
            ) ORDER BY memory_index ASC
            "#,
        )
        .bind(conversation_id)
        .bind(tier.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Fetch: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn fetch_range(
        &self,
        conversation_id: &str,
        tier: Tier,
        start: u64,
        end: u64,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ?1 AND tier = ?2 AND memory_index BETWEEN ?3 AND ?4
            ORDER BY memory_index ASC
            "#,
        )
        .bind(conversation_id)
        .bind(tier.as_str())
        .bind(i64::try_from(start).unwrap_or(i64::MAX))
        .bind(i64::try_from(end).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Fetch range: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn delete(
        &self,
        conversation_id: &str,
        tier: Tier,
        indices: &[u64],
    ) -> Result<usize, StoreError> {
        if indices.is_empty() {
            return Ok(0);
        }

        let placeholders: Vec<String> = (0..indices.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "DELETE FROM messages \
             WHERE conversation_id = ?1 AND tier = ?2 AND memory_index IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(conversation_id).bind(tier.as_str());
        for index in indices {
            query = query.bind(*index as i64);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("DELETE failed: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear(&self, conversation_id: &str, tier: Option<Tier>) -> Result<usize, StoreError> {
        let result = match tier {
            Some(tier) => {
                sqlx::query("DELETE FROM messages WHERE conversation_id = ?1 AND tier = ?2")
                    .bind(conversation_id)
                    .bind(tier.as_str())
                    .execute(&self.pool)
                    .await
            }
            None => {
                sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
                    .bind(conversation_id)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Persistence(format!("CLEAR failed: {e}")))?;

        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, conversation_id: &str, tier: Tier) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM messages WHERE conversation_id = ?1 AND tier = ?2",
        )
        .bind(conversation_id)
        .bind(tier.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("COUNT: {e}")))?;

        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| StoreError::Persistence(format!("cnt column: {e}")))?;
        Ok(cnt as usize)
    }

    async fn last_index(
        &self,
        conversation_id: &str,
        tier: Tier,
    ) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(MAX_INDEX_SQL)
            .bind(conversation_id)
            .bind(tier.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("MAX(memory_index): {e}")))?;

        let max_index: Option<i64> = row
            .try_get("max_index")
            .map_err(|e| StoreError::Persistence(format!("max_index column: {e}")))?;
        Ok(max_index.map(|i| i as u64))
    }

    async fn conversations(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT conversation_id FROM messages ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Conversations: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("conversation_id")
                    .map_err(|e| StoreError::Corrupt(format!("conversation_id column: {e}")))
            })
            .collect()
    }

    async fn mark_uploaded(&self, message_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE messages SET upload_status = 1 WHERE id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("UPDATE upload_status: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_uploads(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE upload_status = 0 ORDER BY created_at, rowid LIMIT ?1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Pending uploads: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    async fn test_backend() -> SqliteBackend {
        SqliteBackend::new("sqlite::memory:").await.unwrap()
    }

    async fn insert(db: &SqliteBackend, conv: &str, tier: Tier, content: &str) -> StoredRecord {
        db.insert(conv, tier, Message::user("alice", content).with_tier(tier))
            .await
            .unwrap()
            .into_record()
    }

    #[tokio::test]
    async fn indices_start_at_zero_per_key() {
        let db = test_backend().await;
        assert_eq!(insert(&db, "c1", Tier::Stm, "a").await.memory_index, 0);
        assert_eq!(insert(&db, "c1", Tier::Stm, "b").await.memory_index, 1);
        assert_eq!(insert(&db, "c1", Tier::Ltm, "s").await.memory_index, 0);
        assert_eq!(insert(&db, "c2", Tier::Stm, "x").await.memory_index, 0);
        assert_eq!(db.last_index("c1", Tier::Stm).await.unwrap(), Some(1));
        assert_eq!(db.last_index("c1", Tier::Profile).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stored_message_carries_its_metadata() {
        let db = test_backend().await;
        insert(&db, "c1", Tier::Stm, "hello").await;
        let records = db.fetch("c1", Tier::Stm, None).await.unwrap();
        let msg = &records[0].message;
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.conversation_id(), Some("c1"));
        assert_eq!(msg.memory_index(), Some(0));
        assert_eq!(msg.metadata.memory_type, Some(Tier::Stm));
        assert!(!records[0].uploaded);
    }

    #[tokio::test]
    async fn duplicate_id_returns_existing_record() {
        let db = test_backend().await;
        let msg = Message::user("alice", "once");
        let first = db.insert("c1", Tier::Stm, msg.clone()).await.unwrap();
        let second = db.insert("c1", Tier::Stm, msg).await.unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(second.record().memory_index, 0);
        assert_eq!(db.count("c1", Tier::Stm).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_message_consumes_no_index() {
        let db = test_backend().await;
        let bad = Message::user("alice", "x").with_id("");
        assert!(matches!(
            db.insert("c1", Tier::Stm, bad).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert_eq!(insert(&db, "c1", Tier::Stm, "ok").await.memory_index, 0);
    }

    #[tokio::test]
    async fn recent_n_keeps_last_in_ascending_order() {
        let db = test_backend().await;
        for i in 0..6 {
            insert(&db, "c1", Tier::Stm, &format!("m{i}")).await;
        }
        let recent = db.fetch("c1", Tier::Stm, Some(2)).await.unwrap();
        let indices: Vec<u64> = recent.iter().map(|r| r.memory_index).collect();
        assert_eq!(indices, vec![4, 5]);

        let all = db.fetch("c1", Tier::Stm, Some(100)).await.unwrap();
        assert_eq!(all.len(), 6);
    }

    #[tokio::test]
    async fn delete_does_not_renumber() {
        let db = test_backend().await;
        for i in 0..10 {
            insert(&db, "c1", Tier::Stm, &format!("m{i}")).await;
        }
        assert_eq!(db.delete("c1", Tier::Stm, &[3]).await.unwrap(), 1);
        let indices: Vec<u64> = db
            .fetch("c1", Tier::Stm, None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.memory_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
        assert_eq!(db.count("c1", Tier::Stm).await.unwrap(), 9);
        assert_eq!(insert(&db, "c1", Tier::Stm, "next").await.memory_index, 10);
    }

    #[tokio::test]
    async fn clear_one_tier_or_all() {
        let db = test_backend().await;
        insert(&db, "c1", Tier::Stm, "a").await;
        insert(&db, "c1", Tier::Ltm, "b").await;
        insert(&db, "c2", Tier::Stm, "c").await;

        assert_eq!(db.clear("c1", Some(Tier::Ltm)).await.unwrap(), 1);
        assert_eq!(db.count("c1", Tier::Stm).await.unwrap(), 1);
        assert_eq!(db.clear("c1", None).await.unwrap(), 1);
        assert_eq!(db.conversations().await.unwrap(), vec!["c2".to_string()]);
    }

    #[tokio::test]
    async fn upload_status_round_trip() {
        let db = test_backend().await;
        let first = insert(&db, "c1", Tier::Stm, "a").await;
        insert(&db, "c1", Tier::Stm, "b").await;

        assert_eq!(db.pending_uploads(10).await.unwrap().len(), 2);
        assert!(db.mark_uploaded(&first.message.id).await.unwrap());
        let pending = db.pending_uploads(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].memory_index, 1);

        assert!(!db.mark_uploaded("no-such-message").await.unwrap());
    }

    #[tokio::test]
    async fn late_ack_leaves_reused_index_pending() {
        let db = test_backend().await;
        let old = insert(&db, "c1", Tier::Stm, "old").await;
        db.clear("c1", None).await.unwrap();
        let new = insert(&db, "c1", Tier::Stm, "new").await;
        assert_eq!(new.memory_index, old.memory_index);

        assert!(!db.mark_uploaded(&old.message.id).await.unwrap());
        let pending = db.pending_uploads(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.id, new.message.id);
    }

    #[tokio::test]
    async fn fetch_range_is_inclusive_and_skips_holes() {
        let db = test_backend().await;
        for i in 0..8 {
            insert(&db, "c1", Tier::Stm, &format!("m{i}")).await;
        }
        insert(&db, "c1", Tier::Ltm, "summary").await;
        db.delete("c1", Tier::Stm, &[3]).await.unwrap();

        let window = db.fetch_range("c1", Tier::Stm, 2, 5).await.unwrap();
        let indices: Vec<u64> = window.iter().map(|r| r.memory_index).collect();
        assert_eq!(indices, vec![2, 4, 5]);

        assert!(db.fetch_range("c1", Tier::Stm, 20, 30).await.unwrap().is_empty());
        assert!(db.fetch_range("c1", Tier::Stm, 5, 2).await.unwrap().is_empty());
        assert_eq!(db.fetch_range("c1", Tier::Ltm, 0, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_insert_does_not_leak_transaction() {
        let db = test_backend().await;
        for micros in 0..200u64 {
            let _ = tokio::time::timeout(
                std::time::Duration::from_micros(micros),
                db.insert("c1", Tier::Stm, Message::user("alice", format!("maybe {micros}"))),
            )
            .await;

            db.insert("c1", Tier::Stm, Message::user("alice", format!("sure {micros}")))
                .await
                .unwrap_or_else(|e| panic!("insert after cancel at {micros}us failed: {e}"));
        }

        let indices: Vec<u64> = db
            .fetch("c1", Tier::Stm, None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.memory_index)
            .collect();
        let expected: Vec<u64> = (0..indices.len() as u64).collect();
        assert_eq!(indices, expected);
    }

    #[tokio::test]
    async fn concurrent_inserts_are_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SqliteBackend::open(&dir.path().join("sql.db")).await.unwrap());

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move {
                    db.insert("c1", Tier::Stm, Message::user("alice", format!("m{i}")))
                        .await
                        .unwrap()
                        .into_record()
                        .memory_index
                })
            })
            .collect();

        let mut indices = BTreeSet::new();
        for task in tasks {
            assert!(indices.insert(task.await.unwrap()));
        }
        assert_eq!(indices, (0..40).collect::<BTreeSet<u64>>());
    }

    #[tokio::test]
    async fn reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sql.db");
        {
            let db = SqliteBackend::open(&path).await.unwrap();
            insert(&db, "c1", Tier::Profile, "profile").await;
        }
        let db = SqliteBackend::open(&path).await.unwrap();
        let records = db.fetch("c1", Tier::Profile, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.tier, Tier::Profile);
    }

    #[tokio::test]
    async fn backend_name() {
        let db = test_backend().await;
        assert_eq!(db.name(), "sqlite");
    }
}
