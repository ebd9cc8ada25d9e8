//! Session state machine.
//!
//! A [`Session`] is the transport-independent view of one client: its id,
//! its [`ConnectionState`], the heartbeat and timeout timers, the application
//! sink and the transport handler currently bound to it.
//!
//! ```text
//! Connecting ──handshake──► Connected ──close──► Closing
//!      │                       │                    │
//!      └───────────────────────┴────────────────────┴──► Closed | Disconnected
//! ```
//!
//! All mutable fields live behind one lock. The lock is never held while
//! calling into the application or the transport handler; inbound delivery
//! is serialized separately so frames reach the application in arrival order.

use std::borrow::Borrow;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, TransportError};
use crate::inbound::{Inbound, Outbound};
use crate::keepalive::{TimerKind, TimerSlot};
use crate::protocol::{Frame, FrameType, MessageType};
use crate::registry::SessionMap;
use crate::transport::TransportHandler;

/// Close id used for server-initiated closes.
pub const SERVER_CLOSE_ID: &str = "server";

/// Opaque, unguessable session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, handshake not finished.
    Connecting,
    /// Handshake done, messages flow both ways.
    Connected,
    /// Graceful close in progress; no new application messages are sent.
    Closing,
    /// Terminal, after a completed graceful close.
    Closed,
    /// Terminal, after a disconnect, timeout or failure.
    Disconnected,
}

impl ConnectionState {
    /// True for `Closed` and `Disconnected`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Disconnected)
    }
}

/// Why a session ended, reported once to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit disconnect by either side.
    Disconnect,
    /// No activity within the timeout window.
    Timeout,
    /// Graceful close completed.
    Closed,
    /// Transport failure.
    Error,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Disconnect => write!(f, "DISCONNECT"),
            DisconnectReason::Timeout => write!(f, "TIMEOUT"),
            DisconnectReason::Closed => write!(f, "CLOSED"),
            DisconnectReason::Error => write!(f, "ERROR"),
        }
    }
}

struct SessionInner {
    state: ConnectionState,
    heartbeat: Duration,
    timeout: Duration,
    handler: Option<Arc<dyn TransportHandler>>,
    inbound: Option<Arc<dyn Inbound>>,
    heartbeat_timer: TimerSlot,
    timeout_timer: TimerSlot,
    close_id: Option<String>,
    heartbeat_seq: u64,
    connected: bool,
    shut_down: bool,
}

/// One client's logical connection.
pub struct Session {
    id: SessionId,
    me: Weak<Session>,
    registry: Weak<SessionMap>,
    inner: Mutex<SessionInner>,
    delivery: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("heartbeat", &inner.heartbeat)
            .field("timeout", &inner.timeout)
            .field(
                "transport",
                &inner.handler.as_ref().map(|h| h.transport_name()),
            )
            .finish()
    }
}

impl Session {
    pub(crate) fn new(id: SessionId, inbound: Arc<dyn Inbound>, registry: Weak<SessionMap>) -> Arc<Self> {
        Arc::new_cyclic(|me| Session {
            id,
            me: me.clone(),
            registry,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Connecting,
                heartbeat: Duration::ZERO,
                timeout: Duration::ZERO,
                handler: None,
                inbound: Some(inbound),
                heartbeat_timer: TimerSlot::new(),
                timeout_timer: TimerSlot::new(),
                close_id: None,
                heartbeat_seq: 0,
                connected: false,
                shut_down: false,
            }),
            delivery: tokio::sync::Mutex::new(()),
        })
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Heartbeat interval; zero disables heartbeats.
    pub fn heartbeat(&self) -> Duration {
        self.inner.lock().heartbeat
    }

    /// Sets the heartbeat interval.
    pub fn set_heartbeat(&self, interval: Duration) {
        self.inner.lock().heartbeat = interval;
    }

    /// Timeout interval; zero disables the timeout timer.
    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// Sets the timeout interval.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().timeout = timeout;
    }

    /// The transport handler currently bound, if any.
    pub fn transport_handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.inner.lock().handler.clone()
    }

    /// Restarts the heartbeat timer. No-op unless connected with a heartbeat.
    pub fn start_heartbeat_timer(&self) {
        let mut inner = self.inner.lock();
        let live = matches!(
            inner.state,
            ConnectionState::Connected | ConnectionState::Closing
        );
        if !live || inner.heartbeat.is_zero() {
            inner.heartbeat_timer.clear();
            return;
        }
        let delay = inner.heartbeat;
        let me = self.me.clone();
        inner.heartbeat_timer.arm(delay, move |generation| async move {
            if let Some(session) = me.upgrade() {
                session.on_timer(TimerKind::Heartbeat, generation).await;
            }
        });
    }

    /// Cancels the heartbeat timer.
    pub fn clear_heartbeat_timer(&self) {
        self.inner.lock().heartbeat_timer.clear();
    }

    /// Restarts the timeout timer. No-op once terminal or with a zero timeout.
    pub fn start_timeout_timer(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.timeout.is_zero() {
            inner.timeout_timer.clear();
            return;
        }
        let delay = inner.timeout;
        let me = self.me.clone();
        inner.timeout_timer.arm(delay, move |generation| async move {
            if let Some(session) = me.upgrade() {
                session.on_timer(TimerKind::Timeout, generation).await;
            }
        });
    }

    /// Cancels the timeout timer.
    pub fn clear_timeout_timer(&self) {
        self.inner.lock().timeout_timer.clear();
    }

    async fn on_timer(&self, kind: TimerKind, generation: u64) {
        let (current, handler, seq) = {
            let mut inner = self.inner.lock();
            let current = match kind {
                TimerKind::Heartbeat => inner.heartbeat_timer.fire(generation),
                TimerKind::Timeout => inner.timeout_timer.fire(generation),
            };
            if current && kind == TimerKind::Heartbeat {
                inner.heartbeat_seq += 1;
            }
            (current, inner.handler.clone(), inner.heartbeat_seq)
        };
        if !current {
            return;
        }

        match kind {
            TimerKind::Heartbeat => {
                let Some(handler) = handler else {
                    return self.on_timeout().await;
                };
                debug!(session = %self.id, seq, "sending heartbeat");
                match handler.send_frame(Frame::heartbeat(seq)).await {
                    Ok(()) => self.start_timeout_timer(),
                    Err(e) => {
                        warn!(session = %self.id, error = %e, "heartbeat could not be sent");
                        self.on_timeout().await;
                    }
                }
            }
            TimerKind::Timeout => self.on_timeout().await,
        }
    }

    /// Disconnects with `Timeout` and tears the transport down.
    pub async fn on_timeout(&self) {
        info!(session = %self.id, "session timed out");
        self.on_disconnect(DisconnectReason::Timeout).await;
        match self.transport_handler() {
            Some(handler) => handler.abort().await,
            None => self.on_shutdown().await,
        }
    }

    /// Binds `handler` and completes the handshake.
    ///
    /// The transport has already sent the session id and heartbeat interval.
    /// Fails if the session was connected before.
    pub async fn on_connect(&self, handler: Arc<dyn TransportHandler>) -> Result<()> {
        let transport = handler.transport_name();
        let inbound = {
            let mut inner = self.inner.lock();
            if inner.connected || inner.state != ConnectionState::Connecting {
                return Err(TransportError::Protocol {
                    reason: format!("session {} is already connected", self.id),
                });
            }
            inner.handler = Some(handler);
            inner.state = ConnectionState::Connected;
            inner.connected = true;
            inner.inbound.clone()
        };
        self.start_heartbeat_timer();
        info!(session = %self.id, transport, "session connected");

        if let (Some(inbound), Some(me)) = (inbound, self.me.upgrade()) {
            inbound.on_connect(Outbound::new(me)).await;
        }
        Ok(())
    }

    /// Dispatches decoded inbound frames in order.
    pub async fn on_messages(&self, frames: Vec<Frame>) {
        let _delivery = self.delivery.lock().await;
        for frame in frames {
            self.on_message(frame).await;
        }
    }

    async fn on_message(&self, frame: Frame) {
        self.start_heartbeat_timer();
        match frame.frame_type() {
            FrameType::Data => {
                let message_type = frame.message_type();
                self.deliver(message_type, frame.into_payload()).await;
            }
            FrameType::Close => self.on_close(frame.into_payload()).await,
            FrameType::Ping => {
                if let Some(handler) = self.transport_handler() {
                    if let Err(e) = handler.send_frame(Frame::pong(frame.into_payload())).await {
                        warn!(session = %self.id, error = %e, "pong could not be sent");
                    }
                }
            }
            FrameType::Heartbeat => {
                let mut inner = self.inner.lock();
                if !inner.heartbeat.is_zero() {
                    inner.timeout_timer.clear();
                }
            }
            FrameType::SessionId | FrameType::HeartbeatInterval | FrameType::Pong => {
                debug!(session = %self.id, frame = %frame, "ignoring control frame");
            }
        }
    }

    async fn deliver(&self, message_type: MessageType, message: String) {
        let inbound = {
            let inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connected | ConnectionState::Closing => inner.inbound.clone(),
                _ => None,
            }
        };
        match inbound {
            Some(inbound) => inbound.on_message(message_type, message).await,
            None => debug!(session = %self.id, "dropping message for inactive session"),
        }
    }

    /// Starts a server-initiated graceful close.
    pub async fn start_close(&self) {
        let handler = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Closing;
            inner.close_id = Some(SERVER_CLOSE_ID.to_string());
            inner.handler.clone()
        };
        info!(session = %self.id, "starting graceful close");
        if let Some(handler) = handler {
            if let Err(e) = handler.send_frame(Frame::close(SERVER_CLOSE_ID)).await {
                if e.is_connection_lost() {
                    error!(session = %self.id, error = %e, "connection lost while closing");
                } else {
                    warn!(session = %self.id, error = %e, "close frame could not be sent");
                }
                handler.abort().await;
            }
        }
    }

    async fn on_close(&self, close_id: String) {
        enum Step {
            Finish,
            Echo,
            Begin,
        }

        let (step, handler) = {
            let mut inner = self.inner.lock();
            let step = match inner.state {
                ConnectionState::Closing if inner.close_id.as_deref() == Some(close_id.as_str()) => {
                    Step::Finish
                }
                ConnectionState::Closing => Step::Echo,
                ConnectionState::Connected => {
                    inner.state = ConnectionState::Closing;
                    Step::Begin
                }
                _ => return,
            };
            (step, inner.handler.clone())
        };
        let Some(handler) = handler else {
            return;
        };

        match step {
            Step::Finish => {
                self.on_disconnect(DisconnectReason::Closed).await;
                handler.abort().await;
            }
            Step::Echo => {
                if handler.send_frame(Frame::close(close_id)).await.is_err() {
                    handler.abort().await;
                }
            }
            Step::Begin => {
                info!(session = %self.id, "client requested close");
                match handler.send_frame(Frame::close(close_id)).await {
                    Ok(()) => handler.disconnect_when_empty(),
                    Err(_) => handler.abort().await,
                }
            }
        }
    }

    /// Moves to a terminal state and reports `reason` to the application.
    ///
    /// Only the first call has an effect.
    pub async fn on_disconnect(&self, reason: DisconnectReason) {
        self.report_disconnect(reason, None).await;
    }

    async fn report_disconnect(&self, reason: DisconnectReason, detail: Option<String>) {
        let inbound = {
            let mut inner = self.inner.lock();
            inner.heartbeat_timer.clear();
            inner.timeout_timer.clear();
            if !inner.state.is_terminal() {
                inner.state = if reason == DisconnectReason::Closed {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Disconnected
                };
            }
            let inbound = inner.inbound.take();
            if inner.connected {
                inbound
            } else {
                None
            }
        };
        if let Some(inbound) = inbound {
            info!(session = %self.id, %reason, "session disconnected");
            inbound.on_disconnect(reason, detail).await;
        }
    }

    /// Final teardown: reports an unreported disconnect, unbinds the handler
    /// and removes the session from its registry. Idempotent.
    pub async fn on_shutdown(&self) {
        let (reason, handler) = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            let reason = inner.inbound.as_ref().map(|_| {
                if inner.state == ConnectionState::Closing {
                    DisconnectReason::Closed
                } else {
                    DisconnectReason::Error
                }
            });
            (reason, inner.handler.take())
        };
        drop(handler);

        match reason {
            Some(DisconnectReason::Error) => {
                self.report_disconnect(DisconnectReason::Error, Some("transport shut down".to_string()))
                    .await
            }
            Some(reason) => self.report_disconnect(reason, None).await,
            None => {
                let mut inner = self.inner.lock();
                inner.heartbeat_timer.clear();
                inner.timeout_timer.clear();
                if !inner.state.is_terminal() {
                    inner.state = ConnectionState::Disconnected;
                }
            }
        }

        if let Some(sessions) = self.registry.upgrade() {
            sessions.remove(&self.id);
        }
        debug!(session = %self.id, "session shut down");
    }

    /// Immediate disconnect, through the bound handler when there is one.
    pub async fn force_disconnect(&self) {
        match self.transport_handler() {
            Some(handler) => handler.disconnect().await,
            None => {
                self.on_disconnect(DisconnectReason::Disconnect).await;
                self.on_shutdown().await;
            }
        }
    }
}
