//! Application-facing surface: the inbound sink and the outbound handle.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use serde::Serialize;

use crate::error::{Result, TransportError};
use crate::protocol::MessageType;
use crate::session::{ConnectionState, DisconnectReason, Session, SessionId};

/// Receives the lifecycle and messages of one session.
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Called exactly once, after the handshake, before any message.
    async fn on_connect(&self, outbound: Outbound);

    /// Called for each application message, in arrival order.
    async fn on_message(&self, message_type: MessageType, message: String);

    /// Called at most once, after `on_connect`; nothing follows it.
    async fn on_disconnect(&self, reason: DisconnectReason, detail: Option<String>);
}

/// Handshake details offered to an [`InboundFactory`].
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Transport the client asked for.
    pub transport: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Negotiated subprotocol (full-duplex only).
    pub protocol: Option<String>,
}

impl HandshakeRequest {
    /// Creates a handshake request with no headers.
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            headers: HeaderMap::new(),
            protocol: None,
        }
    }

    /// Looks up a header as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Decides whether a handshake is accepted and who receives its traffic.
pub trait InboundFactory: Send + Sync {
    /// Returns the sink for a new session, or `None` to refuse it.
    fn accept(&self, request: &HandshakeRequest) -> Option<Arc<dyn Inbound>>;
}

impl<F> InboundFactory for F
where
    F: Fn(&HandshakeRequest) -> Option<Arc<dyn Inbound>> + Send + Sync,
{
    fn accept(&self, request: &HandshakeRequest) -> Option<Arc<dyn Inbound>> {
        self(request)
    }
}

/// Handle through which the application talks back to its client.
#[derive(Clone)]
pub struct Outbound {
    session: Arc<Session>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("session", self.session.id())
            .finish()
    }
}

impl Outbound {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Id of the session behind this handle.
    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    /// Current state of the session.
    pub fn connection_state(&self) -> ConnectionState {
        self.session.connection_state()
    }

    /// Sends a text message.
    pub async fn send_message(&self, message: impl Into<String>) -> Result<()> {
        self.send_typed(MessageType::Text, message).await
    }

    /// Sends a message of the given type.
    pub async fn send_typed(&self, message_type: MessageType, message: impl Into<String>) -> Result<()> {
        let handler = self
            .session
            .transport_handler()
            .ok_or(TransportError::Closed)?;
        handler.send_message(message_type, message.into()).await
    }

    /// Serializes `value` and sends it as a JSON message.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.send_typed(MessageType::Json, encoded).await
    }

    /// Starts a graceful close; queued data still drains.
    pub async fn close(&self) {
        if let Some(handler) = self.session.transport_handler() {
            handler.close().await;
        }
    }

    /// Disconnects immediately.
    pub async fn disconnect(&self) {
        self.session.force_disconnect().await;
    }
}
