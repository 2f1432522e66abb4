//! Session driver.
//!
//! [`LiveSession::mount`] joins and subscribes right away, then spawns a task
//! that refreshes the conversation list and re-invokes the binder only when
//! the identity or the conversation id sequence changed by value. Store
//! notifications that carry the same ids are ignored.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binder::LiveSessionBinder;
use crate::conversation::{ConversationFilter, ConversationSet, ConversationStore};
use crate::identity::{Identity, IdentityCell};

/// A mounted live session. Unmounts on drop.
#[derive(Debug)]
pub struct LiveSession {
    binder: Arc<LiveSessionBinder>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Driver {
    binder: Arc<LiveSessionBinder>,
    store: ConversationStore,
    identity_rx: watch::Receiver<Option<Identity>>,
    conversations_rx: watch::Receiver<ConversationSet>,
    last_identity: Option<Identity>,
    last_ids: Vec<String>,
}

impl LiveSession {
    /// Mount: join as the current identity, subscribe to the conversations
    /// already held, then keep watching for changes.
    ///
    /// If someone is signed in, the conversation list is refreshed in the
    /// background; the resulting set is subscribed when it arrives. Neither
    /// `join` nor `mount` waits for the fetch.
    pub fn mount(
        binder: LiveSessionBinder,
        identity: &IdentityCell,
        store: &ConversationStore,
    ) -> Self {
        let binder = Arc::new(binder);
        let mut identity_rx = identity.subscribe();
        let mut conversations_rx = store.subscribe();

        let current = identity_rx.borrow_and_update().clone();
        binder.activate(current.as_ref());

        let set = conversations_rx.borrow_and_update().clone();
        binder.sync_subscriptions(&set);

        info!(
            name: "session.mounted",
            identity = current.as_ref().map(Identity::as_str),
            conversations = set.len(),
            "Live session mounted"
        );

        let refresh_first = current.is_some();
        let driver = Driver {
            binder: Arc::clone(&binder),
            store: store.clone(),
            identity_rx,
            conversations_rx,
            last_identity: current,
            last_ids: set.ids(),
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(cancel.clone(), refresh_first));

        Self {
            binder,
            cancel,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn binder(&self) -> &LiveSessionBinder {
        &self.binder
    }

    /// Stop watching and wait for the driver to finish.
    pub async fn unmount(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(name: "session.unmounted", "Live session unmounted");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Driver {
    async fn run(mut self, cancel: CancellationToken, refresh_first: bool) {
        if refresh_first && !self.refresh(&cancel).await {
            return;
        }

        let mut watch_identity = true;
        let mut watch_conversations = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = self.identity_rx.changed(), if watch_identity => {
                    if changed.is_err() {
                        debug!(name: "session.identity.closed", "Identity source dropped");
                        watch_identity = false;
                        continue;
                    }
                    if !self.on_identity_changed(&cancel).await {
                        break;
                    }
                }
                changed = self.conversations_rx.changed(), if watch_conversations => {
                    if changed.is_err() {
                        debug!(name: "session.conversations.closed", "Conversation store dropped");
                        watch_conversations = false;
                        continue;
                    }
                    self.on_conversations_changed();
                }
            }
        }
    }

    /// Returns `false` if the session was unmounted meanwhile.
    async fn on_identity_changed(&mut self, cancel: &CancellationToken) -> bool {
        let identity = self.identity_rx.borrow_and_update().clone();
        if identity == self.last_identity {
            return true;
        }
        self.last_identity.clone_from(&identity);

        info!(
            name: "session.identity.changed",
            identity = identity.as_ref().map(Identity::as_str),
            "Identity changed"
        );
        self.binder.activate(identity.as_ref());
        if identity.is_some() {
            return self.refresh(cancel).await;
        }
        true
    }

    fn on_conversations_changed(&mut self) {
        let set = self.conversations_rx.borrow_and_update().clone();
        let ids = set.ids();
        if ids == self.last_ids {
            debug!(name: "session.conversations.unchanged", "Conversation ids unchanged");
            return;
        }
        self.last_ids = ids;
        self.binder.sync_subscriptions(&set);
    }

    /// Refresh with the default filter unless cancelled first. Returns
    /// `false` on cancellation. Fetch errors are logged and swallowed.
    async fn refresh(&self, cancel: &CancellationToken) -> bool {
        let filter = ConversationFilter::default();
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(name: "session.refresh.cancelled", "Unmounted during refresh");
                false
            }
            result = self.store.refresh(&filter) => {
                if let Err(e) = result {
                    warn!(name: "session.refresh.failed", error = %e, "Conversation refresh failed");
                }
                true
            }
        }
    }
}
