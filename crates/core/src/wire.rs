//! Wire format for persisted and mirrored messages.
//!
//! Every encoded record is a JSON object carrying the message fields plus a
//! `__module__`/`__name__` tag pair. Decoding resolves the pair through a
//! static table of known kinds instead of trusting it as a type name.

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::message::Message;

const MODULE_KEY: &str = "__module__";
const NAME_KEY: &str = "__name__";

/// A record kind that can appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Message,
}

impl RecordKind {
    /// The tag pair written for this kind.
    pub fn tag(&self) -> (&'static str, &'static str) {
        match self {
            RecordKind::Message => ("membase.memory.message", "Message"),
        }
    }
}

const KNOWN_KINDS: &[RecordKind] = &[RecordKind::Message];

fn lookup(module: &str, name: &str) -> Option<RecordKind> {
    KNOWN_KINDS
        .iter()
        .copied()
        .find(|kind| kind.tag() == (module, name))
}

/// Encode a message as a tagged JSON object.
pub fn encode_value(message: &Message) -> Result<Value, StoreError> {
    let mut value = serde_json::to_value(message)
        .map_err(|e| StoreError::InvalidArgument(format!("message is not serializable: {e}")))?;
    let (module, name) = RecordKind::Message.tag();
    if let Value::Object(map) = &mut value {
        map.insert(MODULE_KEY.into(), Value::String(module.into()));
        map.insert(NAME_KEY.into(), Value::String(name.into()));
    }
    Ok(value)
}

/// Encode a message as tagged JSON text.
pub fn encode(message: &Message) -> Result<String, StoreError> {
    Ok(encode_value(message)?.to_string())
}

/// Encode a list of messages as a JSON array.
pub fn encode_all(messages: &[Message]) -> Result<String, StoreError> {
    let values = messages
        .iter()
        .map(encode_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(values).to_string())
}

/// Decode a tagged JSON object back into a message.
///
/// Untagged objects are accepted when they look like a message (`id` and
/// `name` present); older hub clients wrote them that way.
pub fn decode_value(value: Value) -> Result<Message, StoreError> {
    let Value::Object(mut map) = value else {
        return Err(StoreError::InvalidArgument(
            "record is not a JSON object".into(),
        ));
    };

    match (map.remove(MODULE_KEY), map.remove(NAME_KEY)) {
        (Some(Value::String(module)), Some(Value::String(name))) => {
            match lookup(&module, &name) {
                Some(RecordKind::Message) => message_from_map(map),
                None => Err(StoreError::InvalidArgument(format!(
                    "unknown record kind {module}.{name}"
                ))),
            }
        }
        (None, None) if map.contains_key("id") && map.contains_key("name") => {
            message_from_map(map)
        }
        _ => Err(StoreError::InvalidArgument(
            "record has no usable kind tag".into(),
        )),
    }
}

/// Decode tagged JSON text into a message.
pub fn decode(text: &str) -> Result<Message, StoreError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| StoreError::InvalidArgument(format!("record is not JSON: {e}")))?;
    decode_value(value)
}

/// Decode a JSON array (or a single object) of messages.
pub fn decode_all(text: &str) -> Result<Vec<Message>, StoreError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| StoreError::InvalidArgument(format!("records are not JSON: {e}")))?;
    match value {
        Value::Array(items) => items.into_iter().map(decode_value).collect(),
        other => Ok(vec![decode_value(other)?]),
    }
}

fn message_from_map(map: Map<String, Value>) -> Result<Message, StoreError> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| StoreError::InvalidArgument(format!("malformed message: {e}")))
}
