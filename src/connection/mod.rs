//! Persistent duplex event channel.
//!
//! A [`Connection`] emits named events with positional JSON arguments and
//! dispatches inbound named events to registered handlers. Emitting is
//! fire-and-forget: nothing waits for the remote side to acknowledge.
//!
//! - [`WsConnection`]: WebSocket transport with automatic reconnect
//! - [`MemoryConnection`]: in-process channel for tests and embedding

mod frame;
mod handlers;
mod memory;
mod websocket;

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

pub use frame::Frame;
pub use handlers::{HandlerId, HandlerRegistry};
pub use memory::MemoryConnection;
pub use websocket::{WsConnection, WsOptions};

/// Callback invoked with the positional arguments of an inbound event.
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Queue an event for delivery. Errors are local only (not connected,
    /// closed, unencodable); remote failures are never reported.
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<()>;

    /// Register `handler` for `event`. Handlers stay registered until
    /// [`Connection::off`] is called with the returned id.
    fn on(&self, event: &str, handler: EventHandler) -> HandlerId;

    /// Unregister a handler. Returns `false` if it was already gone.
    fn off(&self, id: HandlerId) -> bool;

    fn is_connected(&self) -> bool;
}
