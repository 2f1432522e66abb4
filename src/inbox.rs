//! Message inbox.
//!
//! The binder writes every accepted inbound message here through
//! [`MessageInbox::ingest`]. [`MemoryInbox`] keeps per-conversation threads
//! and re-broadcasts each ingested message so views can re-render.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of buffered notifications per subscriber.
const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Sender of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAuthor {
    /// Author's user identifier.
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A chat message as delivered by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message identifier, when the server assigned one.
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Who wrote it.
    #[serde(rename = "user")]
    pub author: MessageAuthor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Creation time; RFC 3339 strings and epoch milliseconds are understood,
    /// anything else reads as `None`.
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    /// Fields this crate does not interpret (attachments, reactions, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Minimal message, mostly useful for tests and local echoes.
    pub fn new(author_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            author: MessageAuthor {
                id: author_id.into(),
                extra: Map::new(),
            },
            content: Some(content.into()),
            created_at: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Identifier of the author.
    #[must_use]
    pub fn author_id(&self) -> &str {
        &self.author.id
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let parsed = match raw {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(Value::Number(millis)) => millis.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    };
    Ok(parsed)
}

/// A message together with the conversation it arrived for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub conversation_id: String,
    pub message: ChatMessage,
}

/// Sink for accepted inbound messages.
///
/// Implementations must accept rapid successive writes from any thread
/// without the caller synchronizing.
pub trait MessageInbox: Send + Sync + std::fmt::Debug {
    fn ingest(&self, incoming: IncomingMessage);
}

/// In-memory inbox keyed by conversation.
#[derive(Debug, Clone)]
pub struct MemoryInbox {
    inner: Arc<InboxInner>,
}

#[derive(Debug)]
struct InboxInner {
    threads: RwLock<HashMap<String, Vec<ChatMessage>>>,
    events: broadcast::Sender<IncomingMessage>,
}

impl Default for MemoryInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInbox {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    /// Inbox whose subscribers lag after `capacity` unread notifications.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(InboxInner {
                threads: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Messages received for a conversation, oldest first.
    #[must_use]
    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.inner
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Conversations that have received at least one message.
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<String> {
        self.inner
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notification stream of every ingested message.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.inner.events.subscribe()
    }
}

impl MessageInbox for MemoryInbox {
    fn ingest(&self, incoming: IncomingMessage) {
        {
            let mut threads = self
                .inner
                .threads
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let thread = threads
                .entry(incoming.conversation_id.clone())
                .or_default();

            let existing = incoming
                .message
                .id
                .as_deref()
                .and_then(|id| thread.iter().position(|m| m.id.as_deref() == Some(id)));
            match existing {
                Some(index) => thread[index] = incoming.message.clone(),
                None => thread.push(incoming.message.clone()),
            }
        }

        debug!(
            name: "inbox.message.ingested",
            conversation_id = %incoming.conversation_id,
            author = %incoming.message.author_id(),
            "Message ingested"
        );

        // No subscribers is fine.
        let _ = self.inner.events.send(incoming);
    }
}
