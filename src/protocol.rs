//! Named events exchanged with the remote coordination service.
//!
//! | Direction | Event | Arguments |
//! |---|---|---|
//! | outbound | `join` | identity string |
//! | outbound | `join-conversations` | array of conversation ids |
//! | inbound | `new-message` | conversation id, message object |
//!
//! `connect` and `disconnect` are local lifecycle events raised by the
//! connection itself; they never travel over the wire.

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::inbox::{ChatMessage, IncomingMessage};

pub const JOIN: &str = "join";
pub const JOIN_CONVERSATIONS: &str = "join-conversations";
pub const NEW_MESSAGE: &str = "new-message";

/// Raised after the connection has been re-established.
pub const CONNECT: &str = "connect";
/// Raised when the connection is lost.
pub const DISCONNECT: &str = "disconnect";

/// Top-level message keys that may carry the author id when `user` is absent.
const AUTHOR_FALLBACK_KEYS: [&str; 2] = ["userId", "senderId"];

/// Events the binder sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// Register this session under a user identity.
    Join(Identity),
    /// Replace this session's conversation subscriptions.
    JoinConversations(Vec<String>),
}

impl OutboundEvent {
    /// Wire event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => JOIN,
            Self::JoinConversations(_) => JOIN_CONVERSATIONS,
        }
    }

    /// Positional arguments.
    #[must_use]
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::Join(identity) => vec![json!(identity.as_str())],
            Self::JoinConversations(ids) => vec![json!(ids)],
        }
    }
}

/// Decode the arguments of a `new-message` event.
pub fn decode_new_message(args: &[Value]) -> Result<IncomingMessage> {
    let conversation_id = args
        .first()
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::malformed(NEW_MESSAGE, "missing conversation id"))?
        .to_string();

    let raw = args
        .get(1)
        .ok_or_else(|| Error::malformed(NEW_MESSAGE, "missing message"))?;

    Ok(IncomingMessage {
        conversation_id,
        message: decode_message(raw)?,
    })
}

fn decode_message(raw: &Value) -> Result<ChatMessage> {
    let Value::Object(fields) = raw else {
        return Err(Error::malformed(NEW_MESSAGE, "message is not an object"));
    };

    let mut fields: Map<String, Value> = fields.clone();
    promote_legacy_id(&mut fields);
    if let Some(Value::Object(user)) = fields.get_mut("user") {
        promote_legacy_id(user);
    }
    if !fields.contains_key("user") {
        let author = AUTHOR_FALLBACK_KEYS
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str).map(str::to_owned))
            .ok_or_else(|| Error::malformed(NEW_MESSAGE, "missing author"))?;
        fields.insert("user".to_string(), json!({ "_id": author }));
    }

    let message: ChatMessage = serde_json::from_value(Value::Object(fields))
        .map_err(|e| Error::malformed(NEW_MESSAGE, e.to_string()))?;

    if message.author_id().trim().is_empty() {
        return Err(Error::malformed(NEW_MESSAGE, "empty author id"));
    }
    Ok(message)
}

/// Mongo documents carry `_id`; some serializers send `id` instead, or both.
/// Moves a lone `id` to `_id` and otherwise leaves `id` as an extra field.
pub(crate) fn promote_legacy_id(fields: &mut Map<String, Value>) {
    if fields.contains_key("_id") {
        return;
    }
    if let Some(id) = fields.remove("id") {
        fields.insert("_id".to_string(), id);
    }
}
