//! Integration tests for the notification bridge against a local websocket
//! backend.
//!
//! The tests that touch `SUPERVISOR_TOKEN` use #[serial] since the process
//! environment is shared between test threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hbus_hub::bridge::{
    BridgeConfig, BridgeError, BridgeStatus, EnvToken, NotificationBridge, NotifyOutcome,
    SettingsFile, StaticToken, TokenError, TokenSource, SUPERVISOR_TOKEN_VAR,
};
use hbus_hub::RouterEvent;
use hbus_protocol::{Event, EventKind};
use serde_json::{json, Value};
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const GOOD_TOKEN: &str = "good-token";
const VERSION: &str = "2024.10.1";
const HUB_UID: &str = "192.168.1.20";
const TEST_WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Fake Backend
// ============================================================================

enum Action {
    Reply(Value),
    Close(u16),
    Ignore,
}

type Handler = fn(&Value) -> Action;

struct FakeBackend {
    url: String,
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
}

impl FakeBackend {
    async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/websocket", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, received) = mpsc::unbounded_channel();

        let count = connections.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(session(tcp, handler, tx.clone()));
            }
        });
        FakeBackend {
            url,
            received,
            connections,
        }
    }

    /// Next message a client sent.
    async fn next(&mut self) -> Value {
        tokio::time::timeout(TEST_WAIT, self.received.recv())
            .await
            .expect("no message from bridge")
            .expect("backend stopped")
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn session(tcp: TcpStream, handler: Handler, received: mpsc::UnboundedSender<Value>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    let hello = json!({"type": "auth_required", "ha_version": VERSION});
    if ws.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let action = handler(&value);
        let _ = received.send(value);
        match action {
            Action::Reply(reply) => {
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
            Action::Close(code) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: "".into(),
                };
                let _ = ws.close(Some(frame)).await;
                return;
            }
            Action::Ignore => {}
        }
    }
}

fn standard(msg: &Value) -> Action {
    let id = msg["id"].clone();
    match msg["type"].as_str() {
        Some("auth") if msg["access_token"] == GOOD_TOKEN => {
            Action::Reply(json!({"type": "auth_ok", "ha_version": VERSION}))
        }
        Some("auth") => Action::Reply(json!({
            "type": "auth_invalid",
            "message": "Invalid access token or password"
        })),
        Some("ping") => Action::Reply(json!({"id": id, "type": "pong"})),
        Some("get_config") => Action::Reply(json!({
            "id": id,
            "type": "result",
            "success": true,
            "result": {"version": VERSION, "location_name": "Home"}
        })),
        Some("call_service") => Action::Reply(json!({
            "id": id,
            "type": "result",
            "success": true,
            "result": null
        })),
        _ => Action::Ignore,
    }
}

fn restarting(msg: &Value) -> Action {
    match msg["type"].as_str() {
        Some("call_service") => Action::Close(1012),
        _ => standard(msg),
    }
}

fn rejecting(msg: &Value) -> Action {
    match msg["type"].as_str() {
        Some("call_service") => Action::Reply(json!({
            "id": msg["id"],
            "type": "result",
            "success": false,
            "error": {"code": "not_found", "message": "Service not found"}
        })),
        _ => standard(msg),
    }
}

/// Backend still booting behind a proxy: every handshake gets a 502.
async fn bad_gateway() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/websocket", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let count = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let mut request = Vec::new();
            let mut chunk = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match tcp.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
            }
            let _ = tcp
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = tcp.shutdown().await;
        }
    });
    (url, connections)
}

// ============================================================================
// Helpers
// ============================================================================

/// Hands out tokens in order, repeating the last one.
struct Rotating(Mutex<VecDeque<&'static str>>);

impl Rotating {
    fn new(tokens: &[&'static str]) -> Box<Self> {
        Box::new(Rotating(Mutex::new(tokens.iter().copied().collect())))
    }
}

impl TokenSource for Rotating {
    fn token(&self) -> Result<String, TokenError> {
        let mut tokens = self.0.lock().unwrap();
        let token = if tokens.len() > 1 {
            tokens.pop_front()
        } else {
            tokens.front().copied()
        };
        Ok(token.unwrap_or_default().to_string())
    }
}

fn config(url: &str) -> BridgeConfig {
    BridgeConfig {
        url: Some(url.to_string()),
        hub_uid: HUB_UID.to_string(),
        reply_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..BridgeConfig::default()
    }
}

fn bridge(url: &str, tokens: Box<dyn TokenSource>) -> NotificationBridge {
    let (_tx, client) = watch::channel(None);
    NotificationBridge::new(config(url), tokens, client)
}

fn output(module: u8, channel: i32) -> RouterEvent {
    RouterEvent {
        router: 1,
        event: Event::new(module, EventKind::Output, channel, 1),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_event_delivered_as_service_call() {
    let mut backend = FakeBackend::start(standard).await;
    let mut bridge = bridge(&backend.url, Box::new(StaticToken(GOOD_TOKEN.into())));

    assert_eq!(bridge.notify(&output(5, 2)).await, NotifyOutcome::Delivered);
    assert!(bridge.is_connected());

    assert_eq!(backend.next().await["type"], "auth");
    let call = backend.next().await;
    assert_eq!(call["type"], "call_service");
    assert_eq!(call["domain"], "habitron");
    assert_eq!(call["service"], "update_entity");
    let data = &call["service_data"];
    assert_eq!(data["hub_uid"], HUB_UID);
    assert_eq!(data["rtr_nmbr"], 1);
    assert_eq!(data["mod_nmbr"], 5);
    assert_eq!(data["evnt_type"], EventKind::Output.code());
    assert_eq!(data["evnt_arg1"], 2);
    assert_eq!(data["evnt_arg2"], 1);

    // Second event reuses the session with a new id.
    assert_eq!(bridge.notify(&output(6, 0)).await, NotifyOutcome::Delivered);
    let next = backend.next().await;
    assert_ne!(next["id"], call["id"]);
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn test_rejected_token_retried_with_fresh_one() {
    let mut backend = FakeBackend::start(standard).await;
    let mut bridge = bridge(&backend.url, Rotating::new(&["stale-token", GOOD_TOKEN]));

    assert_eq!(bridge.notify(&output(5, 2)).await, NotifyOutcome::Delivered);
    assert_eq!(backend.next().await["access_token"], "stale-token");
    assert_eq!(backend.next().await["access_token"], GOOD_TOKEN);
    assert_eq!(backend.next().await["type"], "call_service");
    assert_eq!(backend.connections(), 2);
    assert_eq!(
        *bridge.status().borrow(),
        BridgeStatus::Connected {
            backend_version: Some(VERSION.to_string())
        }
    );
}

#[tokio::test]
async fn test_second_rejection_starts_cooldown() {
    let backend = FakeBackend::start(standard).await;
    let mut bridge = bridge(&backend.url, Box::new(StaticToken("bad-token".into())));

    let err = bridge.connect().await.unwrap_err();
    assert!(matches!(err, BridgeError::AuthRejected(_)));
    assert_eq!(*bridge.status().borrow(), BridgeStatus::AuthCooldown);
    assert_eq!(backend.connections(), 2);

    // No further attempts while cooling down.
    assert_eq!(bridge.notify(&output(5, 2)).await, NotifyOutcome::Dropped);
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn test_bad_gateway_means_backend_restarting() {
    let (url, connections) = bad_gateway().await;
    let mut bridge = bridge(&url, Box::new(StaticToken(GOOD_TOKEN.into())));

    assert_eq!(bridge.notify(&output(5, 2)).await, NotifyOutcome::Dropped);
    assert_eq!(*bridge.status().borrow(), BridgeStatus::AwaitingBackend);
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    // Dropped at once, without another handshake.
    let started = tokio::time::Instant::now();
    assert_eq!(bridge.notify(&output(5, 3)).await, NotifyOutcome::Dropped);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_restart_close_during_delivery() {
    let mut backend = FakeBackend::start(restarting).await;
    let mut bridge = bridge(&backend.url, Box::new(StaticToken(GOOD_TOKEN.into())));

    assert_eq!(bridge.notify(&output(5, 2)).await, NotifyOutcome::Dropped);
    assert!(!bridge.is_connected());
    assert_eq!(*bridge.status().borrow(), BridgeStatus::AwaitingBackend);
    backend.next().await;
    assert_eq!(backend.next().await["type"], "call_service");
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn test_failed_service_call_keeps_session() {
    let backend = FakeBackend::start(rejecting).await;
    let mut bridge = bridge(&backend.url, Box::new(StaticToken(GOOD_TOKEN.into())));

    assert_eq!(bridge.notify(&output(5, 2)).await, NotifyOutcome::Dropped);
    assert!(bridge.is_connected());
    assert!(matches!(
        *bridge.status().borrow(),
        BridgeStatus::Connected { .. }
    ));
    assert_eq!(bridge.notify(&output(5, 3)).await, NotifyOutcome::Dropped);
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn test_keep_alive_and_get_config() {
    let mut backend = FakeBackend::start(standard).await;
    let mut bridge = bridge(&backend.url, Box::new(StaticToken(GOOD_TOKEN.into())));

    let config = bridge.get_config().await.unwrap();
    assert_eq!(config["version"], VERSION);
    bridge.keep_alive().await.unwrap();

    backend.next().await;
    assert_eq!(backend.next().await["type"], "get_config");
    assert_eq!(backend.next().await["type"], "ping");
}

#[tokio::test]
async fn test_keep_alive_without_session_fails() {
    let (_tx, client) = watch::channel(None);
    let mut bridge = NotificationBridge::new(
        BridgeConfig::default(),
        Box::new(StaticToken(GOOD_TOKEN.into())),
        client,
    );
    assert!(bridge.keep_alive().await.is_err());
    assert!(matches!(
        bridge.get_config().await,
        Err(BridgeError::NoBackend)
    ));
}

#[tokio::test]
async fn test_run_forwards_events_until_shutdown() {
    let mut backend = FakeBackend::start(standard).await;
    let bridge = bridge(&backend.url, Box::new(StaticToken(GOOD_TOKEN.into())));
    let mut status = bridge.status();

    let (events_tx, events_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(bridge.run(events_rx, shutdown_rx));

    events_tx.send(output(7, 1)).await.unwrap();
    backend.next().await;
    let call = backend.next().await;
    assert_eq!(call["service_data"]["mod_nmbr"], 7);
    tokio::time::timeout(
        TEST_WAIT,
        status.wait_for(|s| matches!(s, BridgeStatus::Connected { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    shutdown_tx.send_replace(true);
    tokio::time::timeout(TEST_WAIT, task).await.unwrap().unwrap();
    assert_eq!(*status.borrow(), BridgeStatus::Disconnected);
}

#[tokio::test]
async fn test_backend_url_follows_client_address() {
    let (client_tx, client) = watch::channel(None);
    let mut bridge = NotificationBridge::new(
        BridgeConfig::default(),
        Box::new(StaticToken(GOOD_TOKEN.into())),
        client,
    );
    assert!(matches!(
        bridge.connect().await,
        Err(BridgeError::NoBackend)
    ));

    // Nothing listens on the backend port of this address.
    client_tx.send_replace(Some("127.0.0.1".parse().unwrap()));
    match bridge.connect().await {
        Err(BridgeError::Connect { url, .. }) => {
            assert_eq!(url, "ws://127.0.0.1:8123/api/websocket")
        }
        other => panic!("expected connect failure, got {:?}", other),
    }
    assert_eq!(*bridge.status().borrow(), BridgeStatus::Disconnected);
}

fn settings_bytes(client: &str, backend: &str, token: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for field in [client, backend, token] {
        out.push(field.len() as u8);
        out.extend_from_slice(field.as_bytes());
    }
    out
}

#[tokio::test]
async fn test_backend_host_from_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings");
    std::fs::write(&path, settings_bytes("", "127.0.0.1", GOOD_TOKEN)).unwrap();

    let (_tx, client) = watch::channel(None);
    let mut bridge = NotificationBridge::new(
        BridgeConfig {
            settings: Some(SettingsFile::new(&path, None)),
            ..BridgeConfig::default()
        },
        Box::new(StaticToken(GOOD_TOKEN.into())),
        client,
    );

    // Nothing listens on the backend port of the recorded address.
    match bridge.connect().await {
        Err(BridgeError::Connect { url, .. }) => {
            assert_eq!(url, "ws://127.0.0.1:8123/api/websocket")
        }
        other => panic!("expected connect failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_settings_without_backend_address() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings");
    std::fs::write(&path, settings_bytes("10.0.0.7", "", GOOD_TOKEN)).unwrap();

    let (_tx, client) = watch::channel(None);
    let mut bridge = NotificationBridge::new(
        BridgeConfig {
            settings: Some(SettingsFile::new(&path, None)),
            ..BridgeConfig::default()
        },
        Box::new(StaticToken(GOOD_TOKEN.into())),
        client,
    );
    assert!(matches!(
        bridge.connect().await,
        Err(BridgeError::NoBackend)
    ));
}

#[tokio::test]
#[serial]
async fn test_supervisor_token_from_environment() {
    let backend = FakeBackend::start(standard).await;
    std::env::set_var(SUPERVISOR_TOKEN_VAR, GOOD_TOKEN);
    let mut bridge = bridge(&backend.url, Box::new(EnvToken::supervisor()));

    bridge.connect().await.unwrap();
    assert!(bridge.is_connected());
    std::env::remove_var(SUPERVISOR_TOKEN_VAR);
}

#[tokio::test]
#[serial]
async fn test_missing_supervisor_token() {
    let backend = FakeBackend::start(standard).await;
    std::env::remove_var(SUPERVISOR_TOKEN_VAR);
    let mut bridge = bridge(&backend.url, Box::new(EnvToken::supervisor()));

    assert!(matches!(
        bridge.connect().await,
        Err(BridgeError::NoToken(TokenError::MissingVar(_)))
    ));
    assert_eq!(backend.connections(), 0);
}
