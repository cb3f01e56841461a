use super::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(base_url: &str, target: Target) -> ChatConfig {
    let mut config = ChatConfig::new(base_url, target);
    config.auth_timeout = Duration::from_millis(200);
    config.policy = ReconnectPolicy {
        base: Duration::from_millis(100),
        cap: Duration::from_secs(1),
        max_attempts: 5,
    };
    config
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("http://{addr}"))
}

/// Answer one plain-HTTP request with a JSON body, then close.
async fn serve_history(listener: &TcpListener, body: &str) {
    let (mut stream, _) = listener.accept().await.expect("accept http");
    let mut buf = vec![0_u8; 4096];
    let mut read = 0;
    loop {
        let n = stream.read(&mut buf[read..]).await.expect("read request");
        read += n;
        if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.expect("write response");
    stream.shutdown().await.ok();
}

async fn expect_auth_frame(ws: &mut WebSocketStream<TcpStream>) {
    let frame = timeout(WAIT, ws.next())
        .await
        .expect("auth frame should arrive promptly")
        .expect("stream should stay open")
        .expect("frame should read");
    let Message::Text(text) = frame else {
        panic!("expected text auth frame, got {frame:?}");
    };
    let value: serde_json::Value =
        serde_json::from_str(text.as_str()).expect("auth frame is JSON");
    assert_eq!(value["type"], "auth");
    assert!(
        value["token"]
            .as_str()
            .unwrap_or_default()
            .starts_with("Bearer "),
        "token should carry the Bearer prefix"
    );
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ChatEvent>) -> ChatEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event should arrive promptly")
        .expect("event channel should stay open")
}

#[test]
fn ws_url_derives_scheme_and_per_conversation_path() {
    let direct = ws_url(
        "http://localhost:8080",
        &Target::Direct { peer_id: "7".to_owned() },
        "14",
    )
    .expect("direct url");
    assert_eq!(direct, "ws://localhost:8080/ws?userid=14");

    let group = ws_url("https://example.com/", &Target::Group { group_id: 3 }, "14")
        .expect("group url");
    assert_eq!(group, "wss://example.com/ws/group?group_id=3");

    assert!(ws_url("ftp://example.com", &Target::Group { group_id: 3 }, "14").is_err());
}

#[tokio::test]
async fn run_fails_fast_when_logged_out() {
    let config = ChatConfig::new(
        "http://127.0.0.1:9",
        Target::Direct { peer_id: "7".to_owned() },
    );
    let (client, _handle, _events) = ChatClient::new(config, SessionStore::in_memory());
    assert!(matches!(client.run().await, Err(ClientError::NotLoggedIn)));
}

#[tokio::test]
async fn history_then_live_messages_arrive_in_order() {
    let (listener, base_url) = bind().await;
    let config = fast_config(&base_url, Target::Group { group_id: 3 });
    let session = SessionStore::with_credentials("tok", "14");
    let (client, handle, mut events) = ChatClient::new(config, session);

    let server = tokio::spawn(async move {
        let body = serde_json::json!([
            {"id": 1, "group_id": 3, "sender_id": 2, "sender": "A", "text": "hi", "created_at": "t1"}
        ])
        .to_string();
        serve_history(&listener, &body).await;

        let (stream, _) = listener.accept().await.expect("accept ws");
        let mut ws = accept_async(stream).await.expect("ws handshake");
        expect_auth_frame(&mut ws).await;
        ws.send(Message::Text("authenticated".into()))
            .await
            .expect("send sentinel");
        ws.send(Message::Text(
            r#"{"group_id":3,"text":"yo","sender":"B","time":"t2"}"#.into(),
        ))
        .await
        .expect("send live frame");
        while let Some(Ok(_)) = ws.next().await {}
    });

    let run = tokio::spawn(client.run());

    let ChatEvent::History(batch) = next_event(&mut events).await else {
        panic!("expected the history page first");
    };
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].sender, "A");
    assert_eq!(batch[0].content, "hi");

    assert_eq!(next_event(&mut events).await, ChatEvent::Status(None));

    let ChatEvent::Message(live) = next_event(&mut events).await else {
        panic!("expected the live message after history");
    };
    assert_eq!(live.sender, "B");
    assert_eq!(live.content, "yo");

    handle.shutdown();
    run.await.expect("join").expect("run should succeed");
    server.abort();
}

#[tokio::test]
async fn invalid_token_error_clears_credentials_and_never_reconnects() {
    let (listener, base_url) = bind().await;
    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.expect("accept");
            server_accepts.fetch_add(1, Ordering::SeqCst);
            let mut ws = accept_async(stream).await.expect("ws handshake");
            expect_auth_frame(&mut ws).await;
            ws.send(Message::Text(r#"{"error":"invalid token"}"#.into()))
                .await
                .expect("send error envelope");
            while let Some(Ok(_)) = ws.next().await {}
        }
    });

    let path = std::env::temp_dir().join(format!(
        "sochat-client-test-{}.json",
        std::process::id()
    ));
    let mut session = SessionStore::open(path.clone()).expect("open session");
    session.save("tok", "14").expect("save credentials");

    let config = fast_config(&base_url, Target::Direct { peer_id: "7".to_owned() });
    let (client, _handle, mut events) = ChatClient::new(config, session);
    let run = tokio::spawn(client.run());

    let event = next_event(&mut events).await;
    assert!(matches!(event, ChatEvent::AuthRequired(reason) if reason == "invalid token"));
    run.await.expect("join").expect("run should succeed");

    assert!(!path.exists(), "credentials file should be erased");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        accepts.load(Ordering::SeqCst),
        1,
        "fatal auth failure must not reconnect"
    );
    server.abort();
}

#[tokio::test]
async fn handshake_timeout_closes_and_schedules_exactly_one_retry() {
    let (listener, base_url) = bind().await;
    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let server = tokio::spawn(async move {
        // First connection: swallow the auth frame, never acknowledge.
        let (stream, _) = listener.accept().await.expect("accept first");
        server_accepts.fetch_add(1, Ordering::SeqCst);
        let mut ws = accept_async(stream).await.expect("ws handshake");
        expect_auth_frame(&mut ws).await;
        let silent = tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });

        // Second connection: acknowledge, then close normally.
        let (stream, _) = listener.accept().await.expect("accept second");
        server_accepts.fetch_add(1, Ordering::SeqCst);
        let mut ws = accept_async(stream).await.expect("ws handshake");
        expect_auth_frame(&mut ws).await;
        ws.send(Message::Text("authenticated".into()))
            .await
            .expect("send sentinel");
        ws.close(Some(CloseFrame { code: CloseCode::Normal, reason: "".into() }))
            .await
            .ok();
        silent.abort();
    });

    let config = fast_config(&base_url, Target::Direct { peer_id: "7".to_owned() });
    let session = SessionStore::with_credentials("tok", "14");
    let (client, _handle, mut events) = ChatClient::new(config, session);
    let run = tokio::spawn(client.run());

    let event = next_event(&mut events).await;
    assert!(
        matches!(event, ChatEvent::Status(Some(ref s)) if s.starts_with("Connection lost")),
        "timeout should surface the reconnect status, got {event:?}"
    );
    assert_eq!(next_event(&mut events).await, ChatEvent::Status(None));
    let event = next_event(&mut events).await;
    assert!(matches!(event, ChatEvent::Closed(_)));

    run.await.expect("join").expect("run should succeed");
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
    server.abort();
}

#[tokio::test]
async fn shutdown_while_reconnecting_prevents_any_further_connects() {
    let (listener, base_url) = bind().await;
    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = accepts.clone();
    let server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.expect("accept");
            server_accepts.fetch_add(1, Ordering::SeqCst);
            // Tear the socket down without a close handshake.
            let mut ws = accept_async(stream).await.expect("ws handshake");
            expect_auth_frame(&mut ws).await;
            drop(ws);
        }
    });

    let mut config = fast_config(&base_url, Target::Direct { peer_id: "7".to_owned() });
    config.policy.base = Duration::from_millis(300);
    let session = SessionStore::with_credentials("tok", "14");
    let (client, handle, mut events) = ChatClient::new(config, session);
    let run = tokio::spawn(client.run());

    loop {
        let event = next_event(&mut events).await;
        if matches!(event, ChatEvent::Status(Some(ref s)) if s.starts_with("Connection lost")) {
            break;
        }
    }
    handle.shutdown();
    run.await.expect("join").expect("run should succeed");

    let connects_at_shutdown = accepts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        accepts.load(Ordering::SeqCst),
        connects_at_shutdown,
        "no transport open may happen after shutdown"
    );
    server.abort();
}

#[tokio::test]
async fn own_message_echo_is_deduplicated() {
    let (listener, base_url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("ws handshake");
        expect_auth_frame(&mut ws).await;
        ws.send(Message::Text("authenticated".into()))
            .await
            .expect("send sentinel");
        // Echo every frame straight back, as the hub does to the sender.
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                if ws.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    let config = fast_config(&base_url, Target::Direct { peer_id: "7".to_owned() });
    let session = SessionStore::with_credentials("tok", "14");
    let (client, handle, mut events) = ChatClient::new(config, session);
    let run = tokio::spawn(client.run());

    assert_eq!(next_event(&mut events).await, ChatEvent::Status(None));
    assert!(handle.send("hi there"));

    let ChatEvent::Message(optimistic) = next_event(&mut events).await else {
        panic!("expected the optimistic local append");
    };
    assert_eq!(optimistic.sender, "14");
    assert_eq!(optimistic.content, "hi there");

    // The server echo must not produce a second Message event.
    let echo = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(echo.is_err(), "echo should be deduplicated, got {echo:?}");

    handle.shutdown();
    run.await.expect("join").expect("run should succeed");
    server.abort();
}
