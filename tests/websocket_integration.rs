use std::sync::Arc;
use std::time::Duration;

use chat_live_binder::binder::{BinderOptions, LiveSessionBinder};
use chat_live_binder::connection::{Connection, Frame, WsConnection, WsOptions};
use chat_live_binder::conversation::{Conversation, ConversationSet};
use chat_live_binder::identity::{Identity, IdentityCell};
use chat_live_binder::inbox::MemoryInbox;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

/// Next text frame the client sent, decoded.
async fn next_frame(socket: &mut ServerSocket) -> Frame {
    loop {
        let message = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return Frame::decode(text.as_str()).unwrap();
        }
    }
}

fn fast_reconnect() -> WsOptions {
    WsOptions {
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_delay: Duration::from_millis(100),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn set(ids: &[&str]) -> ConversationSet {
    ids.iter().copied().map(Conversation::new).collect()
}

#[tokio::test]
async fn test_binder_frames_reach_server() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        (next_frame(&mut socket).await, next_frame(&mut socket).await)
    });

    let connection = Arc::new(WsConnection::connect(url, WsOptions::default()).await.unwrap());
    assert!(connection.is_connected());

    let identity = IdentityCell::new(Identity::new("u1"));
    let binder = LiveSessionBinder::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(MemoryInbox::new()),
        &identity,
        BinderOptions::default(),
    );
    binder.activate(identity.current().as_ref());
    binder.sync_subscriptions(&set(&["c1", "c2"]));

    let (join, subs) = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(join, Frame::new("join", vec![json!("u1")]));
    assert_eq!(subs, Frame::new("join-conversations", vec![json!(["c1", "c2"])]));

    connection.close().await;
}

#[tokio::test]
async fn test_inbound_message_lands_in_inbox() {
    let (listener, url) = listen().await;
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        ready_rx.await.unwrap();
        for frame in [
            json!(["new-message", "c1", { "_id": "m1", "user": { "_id": "u2" }, "content": "hi" }]),
            json!(["new-message", "c1", { "_id": "m2", "user": { "_id": "u1" }, "content": "echo" }]),
            json!("not a frame"),
        ] {
            socket.send(Message::Text(frame.to_string().into())).await.unwrap();
        }
        socket
    });

    let connection = Arc::new(WsConnection::connect(url, WsOptions::default()).await.unwrap());
    let identity = IdentityCell::new(Identity::new("u1"));
    let inbox = MemoryInbox::new();
    let binder = LiveSessionBinder::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(inbox.clone()),
        &identity,
        BinderOptions::default(),
    );
    ready_tx.send(()).unwrap();

    let _socket = server.await.unwrap();
    wait_until(|| binder.stats().echoes_dropped == 1).await;

    let messages = inbox.messages("c1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("m1"));
    assert_eq!(messages[0].author_id(), "u2");

    connection.close().await;
}

#[tokio::test]
async fn test_pump_survives_bad_frames_and_answers_pings() {
    let (listener, url) = listen().await;
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        ready_rx.await.unwrap();
        for text in ["not json", "\"not a frame\"", "[]", "[42, 1]"] {
            socket.send(Message::Text(text.into())).await.unwrap();
        }
        socket.send(Message::Ping(b"hb".to_vec().into())).await.unwrap();
        let frame = json!(["new-message", "c9", { "_id": "m9", "user": { "_id": "u2" } }]);
        socket.send(Message::Text(frame.to_string().into())).await.unwrap();

        loop {
            let message = timeout(WAIT, socket.next())
                .await
                .expect("no pong")
                .expect("socket closed")
                .unwrap();
            if let Message::Pong(payload) = message {
                return payload.to_vec();
            }
        }
    });

    let connection = Arc::new(WsConnection::connect(url, WsOptions::default()).await.unwrap());
    let identity = IdentityCell::new(Identity::new("u1"));
    let inbox = MemoryInbox::new();
    let binder = LiveSessionBinder::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(inbox.clone()),
        &identity,
        BinderOptions::default(),
    );
    ready_tx.send(()).unwrap();

    wait_until(|| binder.stats().messages_ingested == 1).await;
    assert_eq!(inbox.messages("c9")[0].id.as_deref(), Some("m9"));
    assert!(connection.is_connected());

    let pong = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(pong, b"hb");

    connection.close().await;
}

#[tokio::test]
async fn test_reconnect_rejoins() {
    let (listener, url) = listen().await;
    let (rejoined_tx, rejoined_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let _ = next_frame(&mut first).await;
        let _ = next_frame(&mut first).await;
        let _ = first.close(None).await;
        drop(first);

        let mut second = accept(&listener).await;
        let frames = (next_frame(&mut second).await, next_frame(&mut second).await);
        let _ = rejoined_tx.send(frames);
        // Keep the socket open until the client closes it.
        while second.next().await.is_some() {}
    });

    let connection = Arc::new(WsConnection::connect(url, fast_reconnect()).await.unwrap());
    let identity = IdentityCell::new(Identity::new("u1"));
    let binder = LiveSessionBinder::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(MemoryInbox::new()),
        &identity,
        BinderOptions::default(),
    );
    binder.activate(identity.current().as_ref());
    binder.sync_subscriptions(&set(&["c1"]));

    let (join, subs) = timeout(WAIT, rejoined_rx).await.unwrap().unwrap();
    assert_eq!(join, Frame::new("join", vec![json!("u1")]));
    assert_eq!(subs, Frame::new("join-conversations", vec![json!(["c1"])]));
    assert!(connection.is_connected());

    connection.close().await;
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_emit_after_close_fails() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        while socket.next().await.is_some() {}
    });

    let connection = WsConnection::connect(url, WsOptions::default()).await.unwrap();
    connection.close().await;

    assert!(connection.emit("join", vec![json!("u1")]).is_err());
}

#[tokio::test]
async fn test_connect_refused() {
    let (listener, url) = listen().await;
    drop(listener);

    assert!(WsConnection::connect(url, WsOptions::default()).await.is_err());
}
