//! Message storage for Membase.
//!
//! - [`SqliteBackend`]: durable, one database file per account
//! - [`InMemoryBackend`]: tests and ephemeral sessions
//! - [`MessageStore`]: the front that assigns indices through a backend
//!   and fans committed writes out to the knowledge index and the hub

pub mod in_memory;
pub mod knowledge;
pub mod noop;
pub mod sqlite;
pub mod store;

pub use in_memory::InMemoryBackend;
pub use knowledge::InMemoryKnowledgeIndex;
pub use noop::NoopKnowledgeIndex;
pub use sqlite::SqliteBackend;
pub use store::MessageStore;
