use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_live_binder::binder::{BinderOptions, LiveSessionBinder};
use chat_live_binder::connection::MemoryConnection;
use chat_live_binder::conversation::{
    Conversation, ConversationFetcher, ConversationFilter, ConversationStore,
};
use chat_live_binder::identity::{Identity, IdentityCell};
use chat_live_binder::inbox::MemoryInbox;
use chat_live_binder::session::LiveSession;
use chat_live_binder::{Error, Result};
use serde_json::json;
use tokio::time::timeout;

/// Serves a per-user conversation list and fails while nobody is configured.
#[derive(Debug, Default)]
struct DirectoryFetcher {
    lists: Mutex<Vec<(String, Vec<&'static str>)>>,
    current_user: Mutex<Option<String>>,
}

impl DirectoryFetcher {
    fn with(lists: Vec<(&str, Vec<&'static str>)>) -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::new(
                lists
                    .into_iter()
                    .map(|(user, ids)| (user.to_string(), ids))
                    .collect(),
            ),
            current_user: Mutex::new(None),
        })
    }

    fn serve_as(&self, user: &str) {
        *self.current_user.lock().unwrap() = Some(user.to_string());
    }
}

#[async_trait]
impl ConversationFetcher for DirectoryFetcher {
    async fn fetch(&self, _filter: &ConversationFilter) -> Result<Vec<Conversation>> {
        let user = self.current_user.lock().unwrap().clone();
        let Some(user) = user else {
            return Err(Error::Api {
                status: 401,
                message: "unauthenticated".into(),
            });
        };
        let lists = self.lists.lock().unwrap();
        let ids = lists
            .iter()
            .find(|(u, _)| *u == user)
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default();
        Ok(ids.into_iter().map(Conversation::new).collect())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn new_message(conversation: &str, id: &str, author: &str) -> Vec<serde_json::Value> {
    vec![
        json!(conversation),
        json!({ "_id": id, "user": { "_id": author }, "content": "hello" }),
    ]
}

#[tokio::test]
async fn test_account_switch_rejoins_and_refilters() {
    let fetcher = DirectoryFetcher::with(vec![("alice", vec!["a1", "a2"]), ("bob", vec!["b1"])]);
    fetcher.serve_as("alice");

    let connection = MemoryConnection::new();
    let identity = IdentityCell::new(Identity::new("alice"));
    let store = ConversationStore::new(fetcher.clone());
    let inbox = MemoryInbox::new();

    let binder = LiveSessionBinder::new(
        Arc::new(connection.clone()),
        Arc::new(inbox.clone()),
        &identity,
        BinderOptions::default(),
    );
    let session = LiveSession::mount(binder, &identity, &store);

    assert_eq!(connection.emitted_named("join")[0].args, vec![json!("alice")]);
    wait_until(|| !connection.emitted_named("join-conversations").is_empty()).await;
    assert_eq!(
        connection.emitted_named("join-conversations")[0].args,
        vec![json!(["a1", "a2"])]
    );

    // alice's own message is an echo; bob's is not.
    connection.inject("new-message", new_message("a1", "m1", "alice"));
    connection.inject("new-message", new_message("a1", "m2", "bob"));
    assert_eq!(inbox.len(), 1);

    fetcher.serve_as("bob");
    identity.set(Identity::new("bob"));
    wait_until(|| connection.emitted_named("join").len() == 2).await;
    wait_until(|| connection.emitted_named("join-conversations").len() == 2).await;

    assert_eq!(connection.emitted_named("join")[1].args, vec![json!("bob")]);
    assert_eq!(
        connection.emitted_named("join-conversations")[1].args,
        vec![json!(["b1"])]
    );

    // The filter follows the new identity without re-mounting.
    connection.inject("new-message", new_message("b1", "m3", "bob"));
    connection.inject("new-message", new_message("b1", "m4", "alice"));
    assert_eq!(inbox.messages("b1").len(), 1);
    assert_eq!(inbox.messages("b1")[0].author_id(), "alice");

    let stats = session.binder().stats();
    assert_eq!(stats.echoes_dropped, 2);
    assert_eq!(stats.messages_ingested, 2);

    session.unmount().await;
}

#[tokio::test]
async fn test_reconnect_replays_last_state() {
    let fetcher = DirectoryFetcher::with(vec![("alice", vec!["a1"])]);
    fetcher.serve_as("alice");

    let connection = MemoryConnection::new();
    let identity = IdentityCell::new(Identity::new("alice"));
    let store = ConversationStore::new(fetcher);
    let binder = LiveSessionBinder::new(
        Arc::new(connection.clone()),
        Arc::new(MemoryInbox::new()),
        &identity,
        BinderOptions::default(),
    );
    let session = LiveSession::mount(binder, &identity, &store);
    wait_until(|| !connection.emitted_named("join-conversations").is_empty()).await;
    connection.take_emitted();

    connection.set_connected(false);
    connection.set_connected(true);

    let replayed = connection.take_emitted();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].event, "join");
    assert_eq!(replayed[1].event, "join-conversations");
    assert_eq!(replayed[1].args, vec![json!(["a1"])]);

    session.unmount().await;
}

#[tokio::test]
async fn test_failed_refresh_still_joins() {
    let fetcher = DirectoryFetcher::with(Vec::new());

    let connection = MemoryConnection::new();
    let identity = IdentityCell::new(Identity::new("carol"));
    let store = ConversationStore::new(fetcher);
    let binder = LiveSessionBinder::new(
        Arc::new(connection.clone()),
        Arc::new(MemoryInbox::new()),
        &identity,
        BinderOptions::default(),
    );
    let session = LiveSession::mount(binder, &identity, &store);

    assert_eq!(connection.emitted_named("join").len(), 1);
    assert!(connection.emitted_named("join-conversations").is_empty());

    session.unmount().await;
    assert_eq!(connection.handler_count(), 0);
}
