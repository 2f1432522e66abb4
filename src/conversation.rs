//! Conversation list store.
//!
//! The store owns the user's [`ConversationSet`] and publishes every
//! replacement through a watch channel. The binder only ever reads
//! snapshots; mutation happens through [`ConversationStore::replace`] or a
//! [`ConversationStore::refresh`] against a [`ConversationFetcher`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::promote_legacy_id;

/// Applied by [`HttpConversationFetcher::new`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A chat thread the user participates in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation identifier.
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name, if the server sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Server-side conversation type (individual, group, ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<i64>,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversation {
    /// Conversation with only an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: None,
            extra: Map::new(),
        }
    }
}

/// Ordered collection of conversations with unique identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSet {
    items: Vec<Conversation>,
}

impl ConversationSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a conversation. Returns `false` (and keeps the existing entry)
    /// when the id is already present.
    pub fn insert(&mut self, conversation: Conversation) -> bool {
        if self.contains(&conversation.id) {
            return false;
        }
        self.items.push(conversation);
        true
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|c| c.id == id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.items.iter().find(|c| c.id == id)
    }

    /// Identifiers in iteration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|c| c.id.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Conversation> {
        self.items.iter()
    }
}

impl FromIterator<Conversation> for ConversationSet {
    fn from_iter<I: IntoIterator<Item = Conversation>>(iter: I) -> Self {
        let mut set = Self::new();
        for conversation in iter {
            set.insert(conversation);
        }
        set
    }
}

impl<'a> IntoIterator for &'a ConversationSet {
    type Item = &'a Conversation;
    type IntoIter = std::slice::Iter<'a, Conversation>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Query used to refresh the list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationFilter {
    /// Name substring; empty matches everything.
    pub name: String,
    /// Conversation type; `0` is the server's "all" bucket.
    #[serde(rename = "type")]
    pub kind: i64,
}

/// Source of the conversation list.
#[async_trait]
pub trait ConversationFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>>;
}

/// Fetches `GET {base}/conversations?name=..&type=..`.
#[derive(Clone)]
pub struct HttpConversationFetcher {
    base_url: Url,
    http: reqwest::Client,
    token: Option<String>,
}

impl fmt::Debug for HttpConversationFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConversationFetcher")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl HttpConversationFetcher {
    /// Create a fetcher for the API rooted at `base_url`.
    pub fn new(base_url: impl AsRef<str>, token: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, token, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a fetcher whose requests give up after `timeout`.
    pub fn with_timeout(
        base_url: impl AsRef<str>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(base_url, token, http)
    }

    /// Create a fetcher with a custom reqwest client.
    pub fn with_client(
        base_url: impl AsRef<str>,
        token: Option<String>,
        http: reqwest::Client,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url.as_ref())?;
        // Url::join replaces the last segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            http,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }
}

#[async_trait]
impl ConversationFetcher for HttpConversationFetcher {
    async fn fetch(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>> {
        let mut request = self.http.get(self.url("conversations")?).query(filter);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let raw: Vec<Map<String, Value>> = response.json().await?;
            raw.into_iter().map(decode_conversation).collect()
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            Err(Error::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn decode_conversation(mut fields: Map<String, Value>) -> Result<Conversation> {
    promote_legacy_id(&mut fields);
    Ok(serde_json::from_value(Value::Object(fields))?)
}

/// Shared holder of the current conversation set.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    tx: watch::Sender<ConversationSet>,
    fetcher: Arc<dyn ConversationFetcher>,
}

impl ConversationStore {
    /// Create an empty store backed by `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ConversationFetcher>) -> Self {
        let (tx, _rx) = watch::channel(ConversationSet::new());
        Self {
            inner: Arc::new(StoreInner { tx, fetcher }),
        }
    }

    /// Snapshot of the current set.
    #[must_use]
    pub fn current(&self) -> ConversationSet {
        self.inner.tx.borrow().clone()
    }

    /// Receiver notified on every replacement, changed or not.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConversationSet> {
        self.inner.tx.subscribe()
    }

    /// Replace the whole set and notify subscribers.
    pub fn replace(&self, set: ConversationSet) {
        debug!(name: "conversations.replaced", count = set.len(), "Conversation set replaced");
        self.inner.tx.send_replace(set);
    }

    /// Re-fetch the list with `filter` and replace the set.
    ///
    /// Returns the number of conversations now held.
    pub async fn refresh(&self, filter: &ConversationFilter) -> Result<usize> {
        let conversations = self.inner.fetcher.fetch(filter).await?;
        let set: ConversationSet = conversations.into_iter().collect();
        let count = set.len();
        info!(
            name: "conversations.refreshed",
            count,
            filter_name = %filter.name,
            filter_type = filter.kind,
            "Conversation list refreshed"
        );
        self.replace(set);
        Ok(count)
    }
}
