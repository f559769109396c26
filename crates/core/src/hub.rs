//! Hub transport trait: the remote store that mirrors local records.
//!
//! Mirroring is best-effort: local durability never waits on the hub.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::message::Tier;

/// The body of `POST /api/upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub owner: String,
    pub bucket: String,
    pub id: String,
    /// Serialized record JSON
    pub message: String,
}

#[async_trait]
pub trait HubTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn upload(&self, request: &UploadRequest) -> Result<(), HubError>;

    /// Conversation ids the hub holds for `owner`.
    async fn list_conversations(&self, owner: &str) -> Result<Vec<String>, HubError>;

    /// Serialized messages of one conversation.
    async fn get_conversation(
        &self,
        owner: &str,
        conversation_id: &str,
    ) -> Result<Vec<String>, HubError>;

    async fn download(&self, owner: &str, id: &str) -> Result<Vec<u8>, HubError>;
}

/// Hub object id of a committed record: `{conversation}_{index}`, prefixed
/// with `ltm_` or `profile_` for those tiers.
pub fn hub_object_id(conversation_id: &str, tier: Tier, memory_index: u64) -> String {
    match tier {
        Tier::Stm => format!("{conversation_id}_{memory_index}"),
        Tier::Ltm | Tier::Profile => format!("{tier}_{conversation_id}_{memory_index}"),
    }
}

/// Pick the upload bucket: the message's own name, then the process-wide
/// hub id override, then the owner account.
pub fn resolve_bucket(message_name: Option<&str>, hub_id: Option<&str>, owner: &str) -> String {
    [message_name, hub_id]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(owner)
        .to_string()
}
