//! Chat live session client
//!
//! Connects to the chat server, joins as the token's user, subscribes to the
//! user's conversations and logs every inbound message until Ctrl-C.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use chat_live_binder::binder::{BinderOptions, LiveSessionBinder};
use chat_live_binder::config::AppConfig;
use chat_live_binder::connection::{Connection, WsConnection};
use chat_live_binder::conversation::{ConversationStore, HttpConversationFetcher};
use chat_live_binder::identity::{IdentityCell, IdentitySource, JwtIdentity};
use chat_live_binder::inbox::MemoryInbox;
use chat_live_binder::session::LiveSession;
use chat_live_binder::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let config = AppConfig::load().context("failed to load configuration")?;
    telemetry::init(config.telemetry.json);

    info!(
        name: "config.loaded",
        socket_url = %config.connection.socket_url,
        api_url = %config.api.base_url,
        rejoin_on_reconnect = config.session.rejoin_on_reconnect,
        "Configuration loaded"
    );

    let token = JwtIdentity::new(config.api.token.clone(), config.auth.jwt_secret.clone());
    let identity = IdentityCell::new(token.current_identity());
    if identity.current().is_none() {
        warn!(name: "identity.missing", "No signed-in user; running without a session");
    }

    let connection = Arc::new(
        WsConnection::connect(
            config.connection.socket_url.clone(),
            config.connection.ws_options(),
        )
        .await
        .context("failed to connect to chat server")?,
    );

    let fetcher = HttpConversationFetcher::with_timeout(
        &config.api.base_url,
        config.api.token.clone(),
        config.api.request_timeout(),
    )
    .context("invalid API base URL")?;
    let store = ConversationStore::new(Arc::new(fetcher));

    let inbox = MemoryInbox::new();
    let mut messages = inbox.subscribe();

    let binder = LiveSessionBinder::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(inbox.clone()),
        &identity,
        BinderOptions {
            rejoin_on_reconnect: config.session.rejoin_on_reconnect,
        },
    );
    let session = LiveSession::mount(binder, &identity, &store);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(name: "shutdown.signal.failed", error = %e, "Ctrl-C handler failed");
                }
                break;
            }
            received = messages.recv() => match received {
                Ok(incoming) => {
                    info!(
                        name: "message.received",
                        conversation_id = %incoming.conversation_id,
                        author = %incoming.message.author_id(),
                        content = incoming.message.content.as_deref().unwrap_or(""),
                        "Message received"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(name: "message.lagged", skipped, "Dropped message notifications");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let stats = session.binder().stats();
    session.unmount().await;
    connection.close().await;

    info!(
        name: "shutdown.complete",
        joins = stats.joins_emitted,
        syncs = stats.syncs_emitted,
        ingested = stats.messages_ingested,
        echoes_dropped = stats.echoes_dropped,
        malformed_dropped = stats.malformed_dropped,
        emit_failures = stats.emit_failures,
        stored = inbox.len(),
        "Shutdown complete"
    );

    Ok(())
}
