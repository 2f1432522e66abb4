//! Live session binder.
//!
//! Keeps the remote session's registrations in line with local state and
//! routes inbound `new-message` events into the inbox:
//!
//! - [`LiveSessionBinder::activate`] emits `join` once per identity transition
//! - [`LiveSessionBinder::sync_subscriptions`] emits the whole conversation id
//!   set as `join-conversations` (replacement, never a diff)
//! - inbound messages authored by the current identity are self-echoes and
//!   are dropped; everything else is ingested
//!
//! The inbound handler is registered once at construction and reads the
//! identity from the live [`IdentityCell`] on every dispatch, so identity
//! changes after construction are honoured.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chat_live_binder::binder::{BinderOptions, LiveSessionBinder};
//! use chat_live_binder::connection::MemoryConnection;
//! use chat_live_binder::identity::{Identity, IdentityCell};
//! use chat_live_binder::inbox::MemoryInbox;
//!
//! let connection = MemoryConnection::new();
//! let identity = IdentityCell::new(Identity::new("u1"));
//! let binder = LiveSessionBinder::new(
//!     Arc::new(connection.clone()),
//!     Arc::new(MemoryInbox::new()),
//!     &identity,
//!     BinderOptions::default(),
//! );
//!
//! binder.activate(identity.current().as_ref());
//! assert_eq!(connection.emitted_named("join").len(), 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::{Connection, HandlerId};
use crate::conversation::ConversationSet;
use crate::identity::{Identity, IdentityCell};
use crate::inbox::{IncomingMessage, MessageInbox};
use crate::protocol::{CONNECT, NEW_MESSAGE, OutboundEvent, decode_new_message};

#[derive(Debug, Clone)]
pub struct BinderOptions {
    /// Re-send `join` and the last subscription set after a reconnect.
    pub rejoin_on_reconnect: bool,
}

impl Default for BinderOptions {
    fn default() -> Self {
        Self {
            rejoin_on_reconnect: true,
        }
    }
}

/// Snapshot of the binder's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinderStats {
    pub joins_emitted: u64,
    pub syncs_emitted: u64,
    pub messages_ingested: u64,
    pub echoes_dropped: u64,
    pub malformed_dropped: u64,
    pub emit_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    joins_emitted: AtomicU64,
    syncs_emitted: AtomicU64,
    messages_ingested: AtomicU64,
    echoes_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    emit_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BinderStats {
        BinderStats {
            joins_emitted: self.joins_emitted.load(Ordering::Relaxed),
            syncs_emitted: self.syncs_emitted.load(Ordering::Relaxed),
            messages_ingested: self.messages_ingested.load(Ordering::Relaxed),
            echoes_dropped: self.echoes_dropped.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Binds one client session to the remote coordination service.
///
/// Dropping the binder unregisters its handlers from the connection.
#[derive(Debug)]
pub struct LiveSessionBinder {
    inner: Arc<BinderInner>,
    handler_ids: Vec<HandlerId>,
}

#[derive(Debug)]
struct BinderInner {
    connection: Arc<dyn Connection>,
    inbox: Arc<dyn MessageInbox>,
    identity: watch::Receiver<Option<Identity>>,
    /// Identity the last `join` was issued for.
    active: Mutex<Option<Identity>>,
    /// Ids of the last synced set, possibly empty.
    subscriptions: Mutex<Vec<String>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LiveSessionBinder {
    /// Create a binder and register its inbound handlers on `connection`.
    pub fn new(
        connection: Arc<dyn Connection>,
        inbox: Arc<dyn MessageInbox>,
        identity: &IdentityCell,
        options: BinderOptions,
    ) -> Self {
        let inner = Arc::new(BinderInner {
            connection,
            inbox,
            identity: identity.subscribe(),
            active: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });

        let mut handler_ids = Vec::with_capacity(2);

        // Weak: the connection owns its handlers and BinderInner owns the connection.
        let weak: Weak<BinderInner> = Arc::downgrade(&inner);
        handler_ids.push(inner.connection.on(
            NEW_MESSAGE,
            Arc::new(move |args: &[Value]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_new_message(args);
                }
            }),
        ));

        if options.rejoin_on_reconnect {
            let weak = Arc::downgrade(&inner);
            handler_ids.push(inner.connection.on(
                CONNECT,
                Arc::new(move |_: &[Value]| {
                    if let Some(inner) = weak.upgrade() {
                        inner.rejoin();
                    }
                }),
            ));
        }

        Self { inner, handler_ids }
    }

    /// Register the session under `identity`.
    ///
    /// `None` emits nothing and forgets the active identity, so a later
    /// login joins again. Re-activating the active identity emits nothing.
    pub fn activate(&self, identity: Option<&Identity>) {
        self.inner.activate(identity);
    }

    /// Replace the remote subscriptions with the ids in `set`.
    ///
    /// An empty set emits nothing. Identical consecutive sets are both sent.
    pub fn sync_subscriptions(&self, set: &ConversationSet) {
        self.inner.sync_subscriptions(set);
    }

    /// Apply the author filter to one inbound message.
    pub fn on_inbound_message(&self, incoming: IncomingMessage) {
        self.inner.on_inbound_message(incoming);
    }

    /// Identity of the last `join`.
    #[must_use]
    pub fn active_identity(&self) -> Option<Identity> {
        lock(&self.inner.active).clone()
    }

    #[must_use]
    pub fn stats(&self) -> BinderStats {
        self.inner.counters.snapshot()
    }
}

impl Drop for LiveSessionBinder {
    fn drop(&mut self) {
        for id in self.handler_ids.drain(..) {
            self.inner.connection.off(id);
        }
    }
}

impl BinderInner {
    fn activate(&self, identity: Option<&Identity>) {
        let Some(identity) = identity else {
            if lock(&self.active).take().is_some() {
                debug!(name: "binder.identity.cleared", "Identity cleared");
            } else {
                debug!(name: "binder.join.skipped", "No identity; not joining");
            }
            return;
        };

        {
            let mut active = lock(&self.active);
            if active.as_ref() == Some(identity) {
                debug!(name: "binder.join.unchanged", identity = %identity, "Already joined");
                return;
            }
            *active = Some(identity.clone());
        }

        if self.emit(&OutboundEvent::Join(identity.clone())) {
            Counters::bump(&self.counters.joins_emitted);
            info!(name: "binder.join.emitted", identity = %identity, "Joined");
        }
    }

    fn sync_subscriptions(&self, set: &ConversationSet) {
        let ids = set.ids();
        *lock(&self.subscriptions) = ids.clone();

        if ids.is_empty() {
            debug!(name: "binder.subscriptions.skipped", "No conversations; nothing to join");
            return;
        }

        let count = ids.len();
        if self.emit(&OutboundEvent::JoinConversations(ids)) {
            Counters::bump(&self.counters.syncs_emitted);
            info!(name: "binder.subscriptions.emitted", count, "Conversation subscriptions sent");
        }
    }

    fn handle_new_message(&self, args: &[Value]) {
        match decode_new_message(args) {
            Ok(incoming) => self.on_inbound_message(incoming),
            Err(e) => {
                Counters::bump(&self.counters.malformed_dropped);
                warn!(name: "binder.message.malformed", error = %e, "Dropping inbound message");
            }
        }
    }

    fn on_inbound_message(&self, incoming: IncomingMessage) {
        let is_echo = self
            .identity
            .borrow()
            .as_ref()
            .is_some_and(|me| me.as_str() == incoming.message.author_id());

        if is_echo {
            Counters::bump(&self.counters.echoes_dropped);
            debug!(
                name: "binder.message.echo",
                conversation_id = %incoming.conversation_id,
                "Dropping self-authored echo"
            );
            return;
        }

        self.inbox.ingest(incoming);
        Counters::bump(&self.counters.messages_ingested);
    }

    fn rejoin(&self) {
        let identity = lock(&self.active).clone();
        let ids = lock(&self.subscriptions).clone();
        info!(
            name: "binder.rejoin",
            identity = identity.as_ref().map(Identity::as_str),
            conversations = ids.len(),
            "Restoring session after reconnect"
        );

        if let Some(identity) = identity {
            if self.emit(&OutboundEvent::Join(identity)) {
                Counters::bump(&self.counters.joins_emitted);
            }
        }
        if !ids.is_empty() && self.emit(&OutboundEvent::JoinConversations(ids)) {
            Counters::bump(&self.counters.syncs_emitted);
        }
    }

    /// Best-effort emit. Failures are logged and swallowed.
    fn emit(&self, event: &OutboundEvent) -> bool {
        match self.connection.emit(event.name(), event.args()) {
            Ok(()) => true,
            Err(e) => {
                Counters::bump(&self.counters.emit_failures);
                warn!(
                    name: "binder.emit.failed",
                    event = event.name(),
                    error = %e,
                    "Emit failed; dropping"
                );
                false
            }
        }
    }
}
