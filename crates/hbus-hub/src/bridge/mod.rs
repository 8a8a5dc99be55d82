//! Notification Bridge
//!
//! Forwards router events to the automation backend over its websocket API.
//! The bridge owns the websocket session: it authenticates, keeps the
//! connection alive with pings, reconnects with backoff, and waits out
//! backend restarts without ever blocking the event stream that feeds it.
//!
//! Delivery is at most once per attempt. There is no durable queue; in test
//! mode a bounded in-memory buffer keeps recent events for inspection.

mod messages;
mod token;
pub mod ws;

pub use messages::*;
pub use token::*;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hbus_metrics::metric_defs;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::event_stream::RouterEvent;
use ws::{WsError, WsMessage, WsReader, WsWriter};

/// Websocket port of the backend.
pub const BACKEND_PORT: u16 = 8123;
/// Websocket path of the backend.
pub const BACKEND_PATH: &str = "/api/websocket";
/// First reconnect delay after a transport failure.
pub const BACKOFF_MIN: Duration = Duration::from_secs(1);
/// Longest reconnect delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Retry interval while the backend restarts.
pub const REBOOT_RETRY: Duration = Duration::from_secs(4);
/// Pause after the backend rejected a fresh token.
pub const AUTH_COOLDOWN: Duration = Duration::from_secs(60);
/// Consecutive failures after which test mode stops trying the websocket.
pub const TEST_MODE_MAX_FAILURES: u32 = 2;

/// Close codes sent by a backend that is going away to restart.
const RESTART_CLOSE_CODES: [u16; 2] = [1001, 1012];

/// Errors of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No backend URL, client address or recorded backend address.
    #[error("no backend address known")]
    NoBackend,

    /// No token could be fetched.
    #[error("no access token: {0}")]
    NoToken(#[from] TokenError),

    /// Connecting failed.
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    /// The backend rejected the token.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The backend is up but still booting.
    #[error("backend not ready: {0}")]
    BackendNotReady(String),

    /// The backend closed the connection.
    #[error("connection closed by backend (code {code})")]
    Closed { code: u16 },

    /// No reply in time.
    #[error("no reply from backend within {0:?}")]
    Timeout(Duration),

    /// The backend reported the call as failed.
    #[error("service call failed: {0}")]
    ServiceFailed(String),

    /// Unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Websocket failure on an open connection.
    #[error("websocket error: {0}")]
    Ws(#[from] WsError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the backend signalled that it is restarting.
    pub fn is_backend_restart(&self) -> bool {
        match self {
            BridgeError::BackendNotReady(_) => true,
            BridgeError::Closed { code } => RESTART_CLOSE_CODES.contains(code),
            _ => false,
        }
    }

    /// Whether the session is unusable after this error.
    fn breaks_session(&self) -> bool {
        matches!(
            self,
            BridgeError::Closed { .. }
                | BridgeError::Timeout(_)
                | BridgeError::Ws(_)
                | BridgeError::Protocol(_)
        )
    }
}

/// Connection state of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// No session.
    Disconnected,
    /// Authenticated session.
    Connected { backend_version: Option<String> },
    /// The backend is restarting; retrying at a fixed interval.
    AwaitingBackend,
    /// The backend rejected a fresh token; waiting before trying again.
    AuthCooldown,
}

/// What became of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The backend acknowledged the event.
    Delivered,
    /// Not delivered, kept in the test-mode buffer.
    Buffered,
    /// Not delivered.
    Dropped,
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Backend websocket URL. Derived from the client address when unset,
    /// else from the backend address recorded in `settings`.
    pub url: Option<String>,
    /// Pairing settings file with the recorded backend address.
    pub settings: Option<SettingsFile>,
    /// Identifier of this hub sent with every event.
    pub hub_uid: String,
    /// Ping interval.
    pub keepalive: Duration,
    /// Deadline for replies to calls and pings.
    pub reply_timeout: Duration,
    /// Deadline for the websocket and auth handshake.
    pub handshake_timeout: Duration,
    /// Buffer events and stop trying the websocket after repeated failures.
    pub test_mode: bool,
    /// Capacity of the test-mode buffer.
    pub buffer_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            url: None,
            settings: None,
            hub_uid: String::new(),
            keepalive: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            test_mode: false,
            buffer_len: 1000,
        }
    }
}

/// Backend websocket URL for a client address.
pub fn backend_url(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => format!("ws://{}:{}{}", v4, BACKEND_PORT, BACKEND_PATH),
        IpAddr::V6(v6) => format!("ws://[{}]:{}{}", v6, BACKEND_PORT, BACKEND_PATH),
    }
}

/// Backend websocket URL for a recorded host, an address or a name.
pub fn backend_url_for_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(addr) => backend_url(addr),
        Err(_) => format!("ws://{}:{}{}", host, BACKEND_PORT, BACKEND_PATH),
    }
}

/// Shared view of the test-mode event buffer.
#[derive(Debug, Clone, Default)]
pub struct EventBuffer {
    inner: Arc<Mutex<VecDeque<RouterEvent>>>,
}

impl EventBuffer {
    fn push(&self, event: RouterEvent, cap: usize) {
        let mut buf = self.inner.lock();
        while buf.len() >= cap.max(1) {
            buf.pop_front();
        }
        buf.push_back(event);
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove and return all buffered events, oldest first.
    pub fn take(&self) -> Vec<RouterEvent> {
        self.inner.lock().drain(..).collect()
    }
}

struct Session {
    writer: WsWriter,
    reader: WsReader,
}

/// Forwards events to the backend.
pub struct NotificationBridge {
    config: BridgeConfig,
    tokens: Box<dyn TokenSource>,
    client: watch::Receiver<Option<IpAddr>>,
    session: Option<Session>,
    next_id: u64,
    status: watch::Sender<BridgeStatus>,
    buffer: EventBuffer,
    failures: u32,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl NotificationBridge {
    /// Create a disconnected bridge.
    ///
    /// `client` supplies the backend host when no URL is configured.
    pub fn new(
        config: BridgeConfig,
        tokens: Box<dyn TokenSource>,
        client: watch::Receiver<Option<IpAddr>>,
    ) -> Self {
        NotificationBridge {
            config,
            tokens,
            client,
            session: None,
            next_id: 0,
            status: watch::channel(BridgeStatus::Disconnected).0,
            buffer: EventBuffer::default(),
            failures: 0,
            backoff: BACKOFF_MIN,
            retry_at: None,
        }
    }

    /// Receiver of status changes.
    pub fn status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }

    /// Handle to the test-mode buffer.
    pub fn buffer(&self) -> EventBuffer {
        self.buffer.clone()
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Enable or disable test mode.
    pub fn set_test_mode(&mut self, on: bool) {
        self.config.test_mode = on;
        if !on {
            self.failures = 0;
        }
    }

    fn url(&self) -> Result<String, BridgeError> {
        if let Some(url) = &self.config.url {
            return Ok(url.clone());
        }
        if let Some(client) = *self.client.borrow() {
            return Ok(backend_url(client));
        }
        let settings = self.config.settings.as_ref().ok_or(BridgeError::NoBackend)?;
        match settings.load() {
            Ok(Settings {
                backend_addr: Some(host),
                ..
            }) => Ok(backend_url_for_host(host.trim())),
            Ok(_) => Err(BridgeError::NoBackend),
            Err(e) => {
                debug!("Bridge: no backend address from settings: {}", e);
                Err(BridgeError::NoBackend)
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Open and authenticate a session if none is open.
    ///
    /// A rejected token is retried once with a freshly fetched one; a second
    /// rejection starts the auth cooldown.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        if self.session.is_some() {
            return Ok(());
        }
        let result = self.open_authenticated().await;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(BridgeError::AuthRejected(_)) => "auth_rejected",
            Err(e) if e.is_backend_restart() => "not_ready",
            Err(_) => "failed",
        };
        metrics::counter!(metric_defs::BACKEND_CONNECTS.name, "outcome" => outcome).increment(1);

        match &result {
            Ok(()) => {
                self.failures = 0;
                self.backoff = BACKOFF_MIN;
                self.retry_at = None;
            }
            Err(BridgeError::NoBackend) | Err(BridgeError::NoToken(_)) => {
                self.failures += 1;
            }
            Err(BridgeError::AuthRejected(msg)) => {
                warn!("Bridge: token rejected twice ({}), pausing for {:?}", msg, AUTH_COOLDOWN);
                self.failures += 1;
                self.retry_at = Some(Instant::now() + AUTH_COOLDOWN);
                self.status.send_replace(BridgeStatus::AuthCooldown);
            }
            Err(e) if e.is_backend_restart() => {
                info!("Bridge: waiting for backend to finish loading ({})", e);
                self.failures += 1;
                self.await_backend();
            }
            Err(e) => {
                warn!("Bridge: connect failed, retrying in {:?}: {}", self.backoff, e);
                self.failures += 1;
                self.retry_at = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
                self.status.send_replace(BridgeStatus::Disconnected);
            }
        }
        result
    }

    async fn open_authenticated(&mut self) -> Result<(), BridgeError> {
        let url = self.url()?;
        let token = self.tokens.token()?;
        let opened = match self.open(&url, &token).await {
            Err(BridgeError::AuthRejected(msg)) => {
                warn!("Bridge: token rejected ({}), retrying with a fresh one", msg);
                let token = self.tokens.token()?;
                self.open(&url, &token).await
            }
            other => other,
        };
        let (session, version) = opened?;
        info!(
            "Bridge: connected to {} (backend {})",
            url,
            version.as_deref().unwrap_or("unknown")
        );
        self.session = Some(session);
        self.status.send_replace(BridgeStatus::Connected {
            backend_version: version,
        });
        Ok(())
    }

    async fn open(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Session, Option<String>), BridgeError> {
        let deadline = self.config.handshake_timeout;
        let (mut writer, mut reader) = match timeout(deadline, ws::connect(url)).await {
            Err(_) => {
                return Err(BridgeError::BackendNotReady(
                    "timed out during handshake".into(),
                ))
            }
            Ok(Err(e)) => return Err(classify_connect_error(url, e)),
            Ok(Ok(halves)) => halves,
        };

        match recv_message(&mut reader, deadline).await? {
            Incoming::AuthRequired { .. } => {}
            other => {
                return Err(BridgeError::Protocol(format!(
                    "expected auth_required, got {:?}",
                    other
                )))
            }
        }
        let auth = Outgoing::Auth {
            access_token: token,
        };
        writer.send_text(&auth.to_json()?).await?;

        match recv_message(&mut reader, deadline).await? {
            Incoming::AuthOk { ha_version } => Ok((Session { writer, reader }, ha_version)),
            Incoming::AuthInvalid { message } => {
                let _ = writer.close().await;
                Err(BridgeError::AuthRejected(message.unwrap_or_default()))
            }
            other => Err(BridgeError::Protocol(format!(
                "expected auth result, got {:?}",
                other
            ))),
        }
    }

    fn await_backend(&mut self) {
        self.retry_at = Some(Instant::now() + REBOOT_RETRY);
        self.status.send_replace(BridgeStatus::AwaitingBackend);
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.writer.close().await;
            debug!("Bridge: session closed");
        }
        if matches!(*self.status.borrow(), BridgeStatus::Connected { .. }) {
            self.status.send_replace(BridgeStatus::Disconnected);
        }
    }

    fn drop_session(&mut self, err: &BridgeError) {
        self.session = None;
        if err.is_backend_restart() {
            self.await_backend();
        } else {
            self.status.send_replace(BridgeStatus::Disconnected);
        }
    }

    /// Send `msg` and wait for the reply carrying `id`.
    async fn call(&mut self, id: u64, msg: &Outgoing<'_>) -> Result<Incoming, BridgeError> {
        let deadline = self.config.reply_timeout;
        let text = msg.to_json()?;
        let session = self.session.as_mut().ok_or(BridgeError::Closed {
            code: ws::CLOSE_NO_CODE,
        })?;
        session.writer.send_text(&text).await?;
        let result = timeout(deadline, async {
            loop {
                let reply = recv_message(&mut session.reader, deadline).await?;
                if reply.reply_id() == Some(id) {
                    return Ok(reply);
                }
                debug!("Bridge: skipping {:?} while waiting for reply {}", reply, id);
            }
        })
        .await
        .unwrap_or(Err(BridgeError::Timeout(deadline)));
        if let Err(e) = &result {
            if e.breaks_session() {
                self.drop_session(e);
            }
        }
        result
    }

    async fn deliver(&mut self, event: &RouterEvent) -> Result<(), BridgeError> {
        let id = self.next_id();
        let hub_uid = self.config.hub_uid.clone();
        let msg = Outgoing::event(id, &hub_uid, event);
        match self.call(id, &msg).await? {
            Incoming::Result {
                success: true, ..
            } => Ok(()),
            Incoming::Result { error, .. } => Err(BridgeError::ServiceFailed(
                error.map(|e| e.message).unwrap_or_default(),
            )),
            other => Err(BridgeError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    fn retry_pending(&self) -> bool {
        self.retry_at.is_some_and(|at| Instant::now() < at)
    }

    /// Deliver one event.
    ///
    /// Connects first if needed. A broken connection is re-opened and the
    /// event sent once more. Never waits on a backend that is restarting or
    /// cooling down.
    pub async fn notify(&mut self, event: &RouterEvent) -> NotifyOutcome {
        if self.config.test_mode {
            self.buffer.push(*event, self.config.buffer_len);
        }
        let outcome = self.try_notify(event).await;
        match outcome {
            NotifyOutcome::Delivered => {
                metrics::counter!(metric_defs::EVENTS_DELIVERED.name).increment(1);
                outcome
            }
            _ => {
                metrics::counter!(metric_defs::EVENTS_FAILED.name).increment(1);
                if self.config.test_mode {
                    NotifyOutcome::Buffered
                } else {
                    NotifyOutcome::Dropped
                }
            }
        }
    }

    async fn try_notify(&mut self, event: &RouterEvent) -> NotifyOutcome {
        if self.session.is_none() {
            if self.config.test_mode && self.failures > TEST_MODE_MAX_FAILURES {
                return NotifyOutcome::Dropped;
            }
            if self.retry_pending() {
                debug!("Bridge: backend unavailable, event {} not sent", event.event);
                return NotifyOutcome::Dropped;
            }
            if let Err(e) = self.connect().await {
                warn!("Bridge: event {} not sent, connect failed: {}", event.event, e);
                return NotifyOutcome::Dropped;
            }
        }

        match self.deliver(event).await {
            Ok(()) => {
                debug!("Bridge: event {} delivered", event.event);
                return NotifyOutcome::Delivered;
            }
            Err(e) if e.is_backend_restart() => {
                info!("Bridge: backend restarting, event {} dropped", event.event);
                return NotifyOutcome::Dropped;
            }
            Err(e) if self.session.is_some() => {
                warn!("Bridge: event {} rejected: {}", event.event, e);
                return NotifyOutcome::Dropped;
            }
            Err(e) => warn!("Bridge: delivery failed, reconnecting: {}", e),
        }

        if self.connect().await.is_err() {
            return NotifyOutcome::Dropped;
        }
        match self.deliver(event).await {
            Ok(()) => NotifyOutcome::Delivered,
            Err(e) => {
                warn!("Bridge: event {} dropped after retry: {}", event.event, e);
                NotifyOutcome::Dropped
            }
        }
    }

    /// Ping the backend and wait for the pong.
    pub async fn keep_alive(&mut self) -> Result<(), BridgeError> {
        let id = self.next_id();
        match self.call(id, &Outgoing::Ping { id }).await? {
            Incoming::Pong { .. } => Ok(()),
            other => {
                let err = BridgeError::Protocol(format!("expected pong, got {:?}", other));
                self.drop_session(&err);
                Err(err)
            }
        }
    }

    /// Fetch the backend configuration.
    pub async fn get_config(&mut self) -> Result<serde_json::Value, BridgeError> {
        self.connect().await?;
        let id = self.next_id();
        match self.call(id, &Outgoing::GetConfig { id }).await? {
            Incoming::Result {
                success: true,
                result,
                ..
            } => Ok(result),
            Incoming::Result { error, .. } => Err(BridgeError::ServiceFailed(
                error.map(|e| e.message).unwrap_or_default(),
            )),
            other => Err(BridgeError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    /// Forward events until `events` closes or `shutdown` turns true.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RouterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.notify(&event).await;
                    }
                    None => break,
                },
                _ = keepalive.tick(), if self.session.is_some() => {
                    if let Err(e) = self.keep_alive().await {
                        warn!("Bridge: keep-alive failed: {}", e);
                        if !e.is_backend_restart() {
                            let _ = self.connect().await;
                        }
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() && self.session.is_none() =>
                {
                    self.retry_at = None;
                    if self.connect().await.is_ok() {
                        info!("Bridge: backend available again");
                    }
                }
            }
        }

        self.disconnect().await;
        info!("Bridge: stopped");
    }
}

impl std::fmt::Debug for NotificationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBridge")
            .field("connected", &self.session.is_some())
            .field("status", &*self.status.borrow())
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn classify_connect_error(url: &str, err: WsError) -> BridgeError {
    match ws::handshake_status(&err) {
        Some(502) => BridgeError::BackendNotReady("HTTP 502".into()),
        _ => BridgeError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Read the next JSON message, skipping control frames.
///
/// Pings are answered by the websocket layer itself.
async fn recv_message(reader: &mut WsReader, deadline: Duration) -> Result<Incoming, BridgeError> {
    loop {
        let msg = match timeout(deadline, reader.recv()).await {
            Err(_) => return Err(BridgeError::Timeout(deadline)),
            Ok(None) => {
                return Err(BridgeError::Closed {
                    code: ws::CLOSE_NO_CODE,
                })
            }
            Ok(Some(msg)) => msg?,
        };
        match msg {
            WsMessage::Text(text) => return Ok(Incoming::parse(&text)?),
            WsMessage::Close { code, reason } => {
                debug!("Bridge: close frame {} {}", code, reason);
                return Err(BridgeError::Closed { code });
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbus_protocol::{Event, EventKind};

    fn event(arg2: i32) -> RouterEvent {
        RouterEvent {
            router: 1,
            event: Event::new(5, EventKind::Output, 2, arg2),
        }
    }

    #[test]
    fn test_backend_url_from_client() {
        assert_eq!(
            backend_url("192.168.1.5".parse().unwrap()),
            "ws://192.168.1.5:8123/api/websocket"
        );
        assert_eq!(
            backend_url("fe80::1".parse().unwrap()),
            "ws://[fe80::1]:8123/api/websocket"
        );
    }

    #[test]
    fn test_backend_url_for_recorded_host() {
        assert_eq!(
            backend_url_for_host("10.0.0.9"),
            "ws://10.0.0.9:8123/api/websocket"
        );
        assert_eq!(
            backend_url_for_host("homeassistant.local"),
            "ws://homeassistant.local:8123/api/websocket"
        );
    }

    #[test]
    fn test_restart_classification() {
        assert!(BridgeError::Closed { code: 1012 }.is_backend_restart());
        assert!(BridgeError::Closed { code: 1001 }.is_backend_restart());
        assert!(!BridgeError::Closed { code: 1000 }.is_backend_restart());
        assert!(BridgeError::BackendNotReady("HTTP 502".into()).is_backend_restart());
        assert!(!BridgeError::AuthRejected(String::new()).is_backend_restart());
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let buffer = EventBuffer::default();
        for v in 0..5 {
            buffer.push(event(v), 3);
        }
        let kept: Vec<i32> = buffer.take().iter().map(|e| e.event.arg2).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_notify_without_backend_is_dropped() {
        let (_tx, client) = watch::channel(None);
        let mut bridge = NotificationBridge::new(
            BridgeConfig::default(),
            Box::new(StaticToken("t".into())),
            client,
        );
        assert_eq!(bridge.notify(&event(1)).await, NotifyOutcome::Dropped);
        assert!(!bridge.is_connected());
        assert_eq!(*bridge.status().borrow(), BridgeStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_test_mode_buffers_and_stops_trying() {
        let (_tx, client) = watch::channel(None);
        let mut bridge = NotificationBridge::new(
            BridgeConfig {
                test_mode: true,
                ..BridgeConfig::default()
            },
            Box::new(StaticToken("t".into())),
            client,
        );
        for v in 0..5 {
            assert_eq!(bridge.notify(&event(v)).await, NotifyOutcome::Buffered);
        }
        assert_eq!(bridge.failures, TEST_MODE_MAX_FAILURES + 1);
        assert_eq!(bridge.buffer().len(), 5);
    }
}
