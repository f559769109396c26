//! # Membase Core
//!
//! Domain types, traits, and error definitions for Membase tiered memory.
//! This crate has **no storage or network dependencies**: it defines the
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here. Implementations live in their
//! respective crates:
//! - [`MessageBackend`]: `membase-memory` (SQLite, in-memory)
//! - [`KnowledgeIndex`]: `membase-memory`
//! - [`HubTransport`]: `membase-hub`
//! - [`Provider`]: `membase-providers`
//! - [`Summarizer`]: `membase-engine`

pub mod error;
pub mod message;
pub mod wire;
pub mod store;
pub mod knowledge;
pub mod hub;
pub mod summarizer;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{Message, MessageMetadata, MessageUrl, Role, Tier};
pub use store::{InsertOutcome, MessageBackend, RecordKey, StoredRecord};
pub use knowledge::{Document, KnowledgeIndex, ScoredDocument};
pub use hub::{HubTransport, UploadRequest};
pub use summarizer::Summarizer;
pub use provider::{Provider, ProviderRequest, ProviderResponse};

/// Prefix of the per-account profile conversation.
pub const PROFILE_CONVERSATION_PREFIX: &str = "membase_profile_";

/// Prefix reserved for derived LTM conversations.
pub const LTM_CONVERSATION_PREFIX: &str = "membase_ltm_";

/// The conversation that holds an account's rolling profile.
pub fn profile_conversation_id(account: &str) -> String {
    format!("{PROFILE_CONVERSATION_PREFIX}{account}")
}

/// Derived conversations are storage like any other but never feed consolidation.
pub fn is_derived_conversation(conversation_id: &str) -> bool {
    conversation_id.starts_with(PROFILE_CONVERSATION_PREFIX)
        || conversation_id.starts_with(LTM_CONVERSATION_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_conversation_is_derived() {
        let id = profile_conversation_id("alice");
        assert_eq!(id, "membase_profile_alice");
        assert!(is_derived_conversation(&id));
        assert!(is_derived_conversation("membase_ltm_chat-1"));
        assert!(!is_derived_conversation("chat-1"));
    }
}
