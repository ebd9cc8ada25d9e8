//! Full-duplex transport over one upgraded socket.
//!
//! The handler never touches the socket itself. It emits [`SocketCommand`]s
//! that the HTTP layer's socket pump writes out, and the pump feeds inbound
//! text messages back through [`WebSocketHandler::on_text`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use http::{header, HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::inbound::Inbound;
use crate::protocol::{self, Frame, MessageType, HANDSHAKE_TOKEN};
use crate::registry::SessionRegistry;
use crate::session::{ConnectionState, DisconnectReason, Session, SERVER_CLOSE_ID};
use crate::transport::{PollRequest, PollResponse, TransportHandler};

/// Transport name of the full-duplex transport.
pub const WEBSOCKET: &str = "websocket";

/// Legacy subprotocol header some clients still send.
pub const LEGACY_PROTOCOL_HEADER: &str = "websocket-protocol";

/// Instruction for the socket pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    /// Write one text message.
    Send(String),
    /// Close the socket.
    Close,
}

struct SocketState {
    outbound: Option<mpsc::Sender<SocketCommand>>,
    initiated: bool,
}

/// Per-session full-duplex handler.
///
/// Outbound frames go through a bounded queue; a producer that finds it full
/// for `max_wait` tears the session down with `Timeout`.
pub struct WebSocketHandler {
    session: Arc<Session>,
    max_wait: Duration,
    state: Mutex<SocketState>,
    me: Weak<WebSocketHandler>,
}

impl std::fmt::Debug for WebSocketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketHandler")
            .field("session", self.session.id())
            .field("initiated", &self.is_initiated())
            .finish()
    }
}

impl WebSocketHandler {
    fn new(session: Arc<Session>, config: &TransportConfig) -> (Arc<Self>, mpsc::Receiver<SocketCommand>) {
        session.set_heartbeat(config.websocket_heartbeat());
        session.set_timeout(config.connection_timeout());
        let (tx, rx) = mpsc::channel(config.socket_queue_capacity());
        let handler = Arc::new_cyclic(|me| WebSocketHandler {
            session,
            max_wait: config.max_idle_time(),
            state: Mutex::new(SocketState {
                outbound: Some(tx),
                initiated: false,
            }),
            me: me.clone(),
        });
        (handler, rx)
    }

    /// The session this handler serves.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True once the `OPEN` handshake completed.
    pub fn is_initiated(&self) -> bool {
        self.state.lock().initiated
    }

    /// Handles one inbound text message from the socket.
    pub async fn on_text(&self, text: &str) {
        self.session.start_heartbeat_timer();
        if self.is_initiated() {
            match protocol::decode(text) {
                Ok(frames) => self.session.on_messages(frames).await,
                Err(e) => warn!(session = %self.session.id(), error = %e, "discarding undecodable message"),
            }
            return;
        }

        if text != HANDSHAKE_TOKEN {
            warn!(session = %self.session.id(), "expected handshake token, closing socket");
            self.close_socket();
            self.session.on_shutdown().await;
            return;
        }
        self.initiate().await;
    }

    async fn initiate(&self) {
        let id = Frame::session_id(self.session.id().as_str()).encode();
        let interval = Frame::heartbeat_interval(self.session.heartbeat()).encode();
        if self.write(id).await.is_err() || self.write(interval).await.is_err() {
            self.close_socket();
            self.session.on_shutdown().await;
            return;
        }
        self.state.lock().initiated = true;

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let handler: Arc<dyn TransportHandler> = me;
        if let Err(e) = self.session.on_connect(handler).await {
            warn!(session = %self.session.id(), error = %e, "handshake failed");
            self.close_socket();
            self.session.on_shutdown().await;
        }
    }

    /// Called by the socket pump once the socket is gone.
    pub async fn on_close(&self) {
        debug!(session = %self.session.id(), "socket closed");
        self.close_socket();
        self.session.on_shutdown().await;
    }

    async fn write(&self, text: String) -> Result<()> {
        let tx = self.state.lock().outbound.clone();
        let Some(tx) = tx else {
            return Err(TransportError::Closed);
        };
        match tx.send_timeout(SocketCommand::Send(text), self.max_wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(TransportError::BackpressureTimeout {
                waited_ms: self.max_wait.as_millis() as u64,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }

    fn close_socket(&self) {
        let tx = self.state.lock().outbound.take();
        if let Some(tx) = tx {
            // A full queue cannot take the close; dropping the sender ends
            // the writer once it drains.
            let _ = tx.try_send(SocketCommand::Close);
        }
    }
}

#[async_trait]
impl TransportHandler for WebSocketHandler {
    fn transport_name(&self) -> &'static str {
        WEBSOCKET
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        match self.write(frame.encode()).await {
            Err(TransportError::ChannelClosed) => {
                warn!(session = %self.session.id(), "socket writer gone");
                self.close_socket();
                self.session.on_shutdown().await;
                Err(TransportError::ChannelClosed)
            }
            Err(e @ TransportError::BackpressureTimeout { .. }) => {
                warn!(session = %self.session.id(), "socket queue stayed full, client stopped reading");
                self.session.on_disconnect(DisconnectReason::Timeout).await;
                self.close_socket();
                self.session.on_shutdown().await;
                Err(e)
            }
            other => other,
        }
    }

    async fn send_message(&self, message_type: MessageType, message: String) -> Result<()> {
        if !self.is_initiated() || self.session.connection_state() != ConnectionState::Connected {
            return Err(TransportError::Closed);
        }
        self.send_frame(Frame::data(message_type, message)).await
    }

    async fn handle(&self, _request: PollRequest) -> PollResponse {
        PollResponse::Error(
            StatusCode::BAD_REQUEST,
            "Unexpected request on upgraded WebSocket connection",
        )
    }

    async fn disconnect(&self) {
        self.session.on_disconnect(DisconnectReason::Disconnect).await;
        let _ = self.write(Frame::close(SERVER_CLOSE_ID).encode()).await;
        self.close_socket();
        self.session.on_shutdown().await;
    }

    async fn close(&self) {
        self.session.start_close().await;
    }

    async fn abort(&self) {
        self.close_socket();
        self.session.on_shutdown().await;
    }

    fn disconnect_when_empty(&self) {}
}

/// Entry point for full-duplex upgrades.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: TransportConfig,
}

impl WebSocketTransport {
    /// Creates the transport.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Transport name as it appears in request paths.
    pub fn name(&self) -> &'static str {
        WEBSOCKET
    }

    /// The socket is closed after this long without inbound data.
    pub fn idle_timeout(&self) -> Duration {
        self.config.max_idle_time()
    }

    /// The client must send the handshake token within this window.
    pub fn handshake_timeout(&self) -> Duration {
        self.config.connection_timeout()
    }

    /// Creates a session for an accepted upgrade.
    ///
    /// The returned receiver must be drained by the socket pump.
    pub fn accept(
        &self,
        registry: &SessionRegistry,
        inbound: Arc<dyn Inbound>,
    ) -> (Arc<WebSocketHandler>, mpsc::Receiver<SocketCommand>) {
        let session = registry.create_session(inbound);
        info!(session = %session.id(), "websocket accepted");
        WebSocketHandler::new(session, &self.config)
    }

    /// True for a `GET` handshake carrying `Upgrade: websocket`.
    pub fn validate_upgrade(method: &Method, session_id: Option<&str>, headers: &HeaderMap) -> bool {
        if method != Method::GET || session_id.is_some() {
            return false;
        }
        headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Subprotocols offered by the client, in preference order.
    pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
        headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .or_else(|| headers.get(LEGACY_PROTOCOL_HEADER))
            .and_then(|v| v.to_str().ok())
            .map(parse_protocols)
            .unwrap_or_default()
    }
}

/// Splits a comma-separated subprotocol header.
pub fn parse_protocols(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
