//! In-process connection.
//!
//! Records everything emitted and lets the caller play the remote side by
//! injecting inbound events or flipping connectivity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use super::{Connection, EventHandler, Frame, HandlerId, HandlerRegistry};
use crate::error::{Error, Result};
use crate::protocol::{CONNECT, DISCONNECT};

#[derive(Debug, Clone)]
pub struct MemoryConnection {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    handlers: HandlerRegistry,
    emitted: Mutex<Vec<Frame>>,
    connected: AtomicBool,
    fail_emits: AtomicBool,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    /// A connected channel with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                handlers: HandlerRegistry::new(),
                emitted: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                fail_emits: AtomicBool::new(false),
            }),
        }
    }

    /// Every frame emitted so far, oldest first.
    #[must_use]
    pub fn emitted(&self) -> Vec<Frame> {
        self.inner
            .emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Emitted frames with the given event name.
    #[must_use]
    pub fn emitted_named(&self, event: &str) -> Vec<Frame> {
        self.emitted()
            .into_iter()
            .filter(|frame| frame.event == event)
            .collect()
    }

    /// Drain the emitted frames.
    pub fn take_emitted(&self) -> Vec<Frame> {
        std::mem::take(
            &mut *self
                .inner
                .emitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Deliver an inbound event as if the remote side had sent it.
    /// Returns the number of handlers that ran.
    pub fn inject(&self, event: &str, args: Vec<Value>) -> usize {
        self.inner.handlers.dispatch(event, &args)
    }

    /// Change connectivity, raising `connect`/`disconnect` on transitions.
    pub fn set_connected(&self, connected: bool) {
        let was = self.inner.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            let event = if connected { CONNECT } else { DISCONNECT };
            self.inner.handlers.dispatch(event, &[]);
        }
    }

    /// Make every subsequent emit fail with a transport error.
    pub fn fail_emits(&self, fail: bool) {
        self.inner.fail_emits.store(fail, Ordering::SeqCst);
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }
}

impl Connection for MemoryConnection {
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        if self.inner.fail_emits.load(Ordering::SeqCst) {
            return Err(Error::Connection("emit rejected by transport".into()));
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.inner
            .emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Frame::new(event, args));
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.inner.handlers.add(event, handler)
    }

    fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
