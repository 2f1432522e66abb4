//! WebSocket transport.
//!
//! One supervisor task owns the socket. It writes queued frames, dispatches
//! inbound frames to handlers, and when the socket drops it raises
//! `disconnect`, reconnects with exponential backoff and raises `connect`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connection, EventHandler, Frame, HandlerId, HandlerRegistry};
use crate::error::{Error, Result};
use crate::protocol::{CONNECT, DISCONNECT};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Floor for the reconnect backoff, so a zero delay still backs off.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

/// Reconnect tuning.
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Wait before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling backoff.
    pub max_reconnect_delay: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl WsOptions {
    /// First wait and cap of the backoff, both at least [`MIN_RECONNECT_DELAY`].
    fn backoff(&self) -> (Duration, Duration) {
        let first = self.reconnect_delay.max(MIN_RECONNECT_DELAY);
        (first, self.max_reconnect_delay.max(first))
    }
}

fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

/// Connection over a WebSocket, framing events as JSON arrays.
pub struct WsConnection {
    inner: Arc<WsInner>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct WsInner {
    url: String,
    handlers: HandlerRegistry,
    outbound: mpsc::UnboundedSender<String>,
    connected: AtomicBool,
}

enum PumpExit {
    Lost,
    Cancelled,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("url", &self.inner.url)
            .field("connected", &self.is_connected())
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl WsConnection {
    /// Open the socket and start the supervisor.
    ///
    /// Fails if the first handshake fails; later drops are retried.
    pub async fn connect(url: impl Into<String>, options: WsOptions) -> Result<Self> {
        let url = url.into();
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("{url}: {e}")))?;

        info!(name: "connection.established", url = %url, "Connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(WsInner {
            url,
            handlers: HandlerRegistry::new(),
            outbound,
            connected: AtomicBool::new(true),
        });
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&inner),
            ws,
            outbound_rx,
            options,
            cancel.clone(),
        ));

        Ok(Self {
            inner,
            cancel,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// URL this connection (re)connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Close the socket and stop reconnecting.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        info!(name: "connection.closed", url = %self.inner.url, "Connection closed");
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Connection for WsConnection {
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let text = Frame::new(event, args).encode()?;
        self.inner
            .outbound
            .send(text)
            .map_err(|_closed| Error::Closed)
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

async fn supervise(
    inner: Arc<WsInner>,
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    options: WsOptions,
    cancel: CancellationToken,
) {
    loop {
        let exit = pump(&inner, ws, &mut outbound, &cancel).await;
        inner.connected.store(false, Ordering::SeqCst);
        if matches!(exit, PumpExit::Cancelled) {
            return;
        }

        let mut stale = 0usize;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        warn!(
            name: "connection.lost",
            url = %inner.url,
            dropped_frames = stale,
            "Connection lost; reconnecting"
        );
        inner.handlers.dispatch(DISCONNECT, &[]);

        let Some(next) = reconnect(&inner.url, &options, &cancel).await else {
            return;
        };
        ws = next;
        inner.connected.store(true, Ordering::SeqCst);
        info!(name: "connection.reconnected", url = %inner.url, "Reconnected");
        inner.handlers.dispatch(CONNECT, &[]);
    }
}

async fn reconnect(url: &str, options: &WsOptions, cancel: &CancellationToken) -> Option<WsStream> {
    let (mut delay, max_delay) = options.backoff();
    let mut attempt = 0u32;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
        match connect_async(url).await {
            Ok((ws, _response)) => return Some(ws),
            Err(e) => {
                debug!(
                    name: "connection.reconnect.failed",
                    url = %url,
                    attempt,
                    error = %e,
                    "Reconnect attempt failed"
                );
                delay = next_delay(delay, max_delay);
            }
        }
    }
}

async fn pump(
    inner: &WsInner,
    ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return PumpExit::Cancelled;
            }
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    return PumpExit::Cancelled;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(name: "connection.send.failed", error = %e, "WebSocket send failed");
                    return PumpExit::Lost;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch_text(inner, text.as_str()),
                Some(Ok(Message::Close(_))) | None => return PumpExit::Lost,
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(name: "connection.read.failed", error = %e, "WebSocket read failed");
                    return PumpExit::Lost;
                }
            }
        }
    }
}

fn dispatch_text(inner: &WsInner, text: &str) {
    match Frame::decode(text) {
        Ok(frame) => {
            let handled = inner.handlers.dispatch(&frame.event, &frame.args);
            debug!(
                name: "connection.event.received",
                event = %frame.event,
                handlers = handled,
                "Inbound event"
            );
        }
        Err(e) => {
            warn!(name: "connection.frame.malformed", error = %e, "Dropping malformed frame");
        }
    }
}
