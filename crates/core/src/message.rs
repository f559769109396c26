//! Message domain types.
//!
//! A [`Message`] is immutable once the store has assigned its memory index.
//! Its [`Tier`] places it in one of the three per-conversation streams:
//! raw turns (STM), distilled summaries (LTM) or the rolling profile.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StoreError;

/// Timestamp layout used for every message.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The memory tier a message belongs to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Raw, unsummarized conversational turns
    #[default]
    Stm,
    /// Periodic summaries distilled from STM batches
    Ltm,
    /// Account-level rolling profile
    Profile,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Stm, Tier::Ltm, Tier::Profile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Stm => "stm",
            Tier::Ltm => "ltm",
            Tier::Profile => "profile",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stm" => Ok(Tier::Stm),
            "ltm" => Ok(Tier::Ltm),
            "profile" => Ok(Tier::Profile),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown tier '{other}', expected stm, ltm or profile"
            ))),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The agent
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(StoreError::InvalidArgument(format!(
                "invalid role '{other}', expected system, user or assistant"
            ))),
        }
    }
}

/// One URL or several, pointing at multimodal content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageUrl {
    One(String),
    Many(Vec<String>),
}

impl MessageUrl {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            MessageUrl::One(url) => std::slice::from_ref(url),
            MessageUrl::Many(urls) => urls.as_slice(),
        };
        slice.iter().map(String::as_str)
    }
}

/// Typed message metadata.
///
/// `conversation`, `memory_index` and `memory_type` are owned by the store;
/// anything else callers attach lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<Tier>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    const RESERVED: [&'static str; 3] = ["conversation", "memory_index", "memory_type"];

    /// Attach a caller-defined key. Store-owned keys are rejected.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let key = key.into();
        if Self::RESERVED.contains(&key.as_str()) {
            return Err(StoreError::InvalidArgument(format!(
                "metadata key '{key}' is assigned by the store"
            )));
        }
        self.extra.insert(key, value);
        Ok(())
    }
}

/// A single memory unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who produced the message (also the default hub bucket)
    pub name: String,

    /// The text content; structured summaries are stored as JSON text
    #[serde(deserialize_with = "content_as_text")]
    pub content: String,

    pub role: Role,

    #[serde(default)]
    pub url: Option<MessageUrl>,

    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: MessageMetadata,

    /// Creation time, formatted with [`TIMESTAMP_FORMAT`]
    pub timestamp: String,

    /// Older records carry no `type`; they are short-term turns.
    #[serde(rename = "type", default)]
    pub tier: Tier,
}

impl Message {
    /// Create a new short-term message.
    pub fn new(name: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            content: content.into(),
            role,
            url: None,
            metadata: MessageMetadata::default(),
            timestamp: now_timestamp(),
            tier: Tier::Stm,
        }
    }

    /// Create a new user message.
    pub fn user(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(name, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(name, Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(name, Role::System, content)
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_url(mut self, url: MessageUrl) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Index assigned by the store, if committed.
    pub fn memory_index(&self) -> Option<u64> {
        self.metadata.memory_index
    }

    /// Conversation recorded by the store, if committed.
    pub fn conversation_id(&self) -> Option<&str> {
        self.metadata.conversation.as_deref()
    }

    /// Check the fields every stored message must carry.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("message id is empty".into()));
        }
        if self.timestamp.trim().is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "message {} has no timestamp",
                self.id
            )));
        }
        if let Some(MessageUrl::Many(urls)) = &self.url
            && urls.iter().any(|u| u.trim().is_empty())
        {
            return Err(StoreError::InvalidArgument(format!(
                "message {} has an empty url",
                self.id
            )));
        }
        Ok(())
    }

    /// `name: content`, followed by one `name: url` line per URL.
    pub fn formatted(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.name, self.content)];
        if let Some(url) = &self.url {
            lines.extend(url.iter().map(|u| format!("{}: {u}", self.name)));
        }
        lines.join("\n")
    }
}

/// Current local time in the message timestamp layout.
pub fn now_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Hub records may carry structured content; keep it as JSON text.
fn content_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Accept `null`, an object, or a bare string (kept under `extra.note`).
fn lenient_metadata<'de, D>(deserializer: D) -> Result<MessageMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Object(MessageMetadata),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => MessageMetadata::default(),
        Some(Raw::Object(meta)) => meta,
        Some(Raw::Text(text)) => {
            let mut meta = MessageMetadata::default();
            meta.extra
                .insert("note".into(), serde_json::Value::String(text));
            meta
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("alice", "Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.tier, Tier::Stm);
        assert_eq!(msg.id.len(), 32);
        assert!(msg.memory_index().is_none());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn tier_and_role_parse() {
        assert_eq!("LTM".parse::<Tier>().unwrap(), Tier::Ltm);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
        assert!("episodic".parse::<Tier>().is_err());
    }

    #[test]
    fn missing_type_defaults_to_stm() {
        let json = r#"{"id":"a1","name":"bob","content":"hi","role":"user",
                       "url":null,"metadata":null,"timestamp":"2025-01-01 10:00:00"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.tier, Tier::Stm);
        assert_eq!(msg.metadata, MessageMetadata::default());
    }

    #[test]
    fn structured_content_is_kept_as_json_text() {
        let json = r#"{"id":"a1","name":"bob","content":{"summary":"x"},"role":"assistant",
                       "timestamp":"2025-01-01 10:00:00","type":"ltm"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.content, r#"{"summary":"x"}"#);
        assert_eq!(msg.tier, Tier::Ltm);
    }

    #[test]
    fn string_metadata_becomes_note() {
        let json = r#"{"id":"a1","name":"bob","content":"hi","role":"user",
                       "metadata":"from the old client","timestamp":"2025-01-01 10:00:00"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.metadata.extra["note"], "from the old client");
    }

    #[test]
    fn url_accepts_single_or_list() {
        let one: MessageUrl = serde_json::from_str(r#""https://a""#).unwrap();
        let many: MessageUrl = serde_json::from_str(r#"["https://a","https://b"]"#).unwrap();
        assert_eq!(one.iter().count(), 1);
        assert_eq!(many.iter().collect::<Vec<_>>(), vec!["https://a", "https://b"]);
    }

    #[test]
    fn reserved_metadata_keys_are_rejected() {
        let mut meta = MessageMetadata::default();
        assert!(meta.insert("memory_index", serde_json::json!(4)).is_err());
        meta.insert("channel", serde_json::json!("telegram")).unwrap();
        assert_eq!(meta.extra.len(), 1);
    }

    #[test]
    fn empty_id_fails_validation() {
        let msg = Message::user("alice", "hi").with_id("  ");
        assert!(matches!(msg.validate(), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn formatted_lists_urls() {
        let msg = Message::assistant("bot", "see these").with_url(MessageUrl::Many(vec![
            "https://a".into(),
            "https://b".into(),
        ]));
        assert_eq!(
            msg.formatted(),
            "bot: see these\nbot: https://a\nbot: https://b"
        );
    }
}
