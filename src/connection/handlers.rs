//! Event-name → handler table shared by the connection implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::trace;

use super::EventHandler;

/// Registration handle returned by [`HandlerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_count", &self.len())
            .finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for entries in handlers.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        handlers.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Invoke every handler registered for `event`, in registration order.
    /// Returns how many ran.
    ///
    /// Handlers are called outside the lock, so they may register or remove
    /// handlers themselves.
    pub fn dispatch(&self, event: &str, args: &[Value]) -> usize {
        let targets: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if targets.is_empty() {
            trace!(name: "connection.event.unhandled", event, "No handler for event");
        }
        for handler in &targets {
            handler(args);
        }
        targets.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_and_remove() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let id = registry.add(
            "ping",
            Arc::new(move |args: &[Value]| {
                counter.fetch_add(args.len(), Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.dispatch("ping", &[Value::Null, Value::Null]), 1);
        assert_eq!(registry.dispatch("other", &[]), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.dispatch("ping", &[Value::Null]), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_may_reenter_registry() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.add(
            "register",
            Arc::new(move |_: &[Value]| {
                inner.add("late", Arc::new(|_: &[Value]| {}));
            }),
        );

        registry.dispatch("register", &[]);
        assert_eq!(registry.len(), 2);
    }
}
