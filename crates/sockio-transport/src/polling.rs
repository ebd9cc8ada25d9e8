//! HTTP long-polling transports.
//!
//! `xhr-polling` answers every `GET` with whatever is buffered, suspending it
//! when nothing is. `xhr-streaming` keeps the handshake response open and
//! appends every frame to it. Both accept inbound frames through `POST`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use futures::Stream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::buffer::TransportBuffer;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::inbound::{HandshakeRequest, Inbound, InboundFactory};
use crate::protocol::{self, Frame, MessageType};
use crate::registry::SessionRegistry;
use crate::session::{ConnectionState, DisconnectReason, Session};
use crate::transport::{PollRequest, PollResponse, PollStream, TransportHandler};

/// Single-shot long polling.
pub const XHR_POLLING: &str = "xhr-polling";
/// Persistent long polling over a held-open response.
pub const XHR_STREAMING: &str = "xhr-streaming";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Entry point for long-polling requests.
#[derive(Debug, Clone)]
pub struct LongPollTransport {
    persistent: bool,
    config: TransportConfig,
}

impl LongPollTransport {
    /// `xhr-polling`: one response per `GET`.
    pub fn single_shot(config: TransportConfig) -> Self {
        Self {
            persistent: false,
            config,
        }
    }

    /// `xhr-streaming`: one held-open response for the session's lifetime.
    pub fn persistent(config: TransportConfig) -> Self {
        Self {
            persistent: true,
            config,
        }
    }

    /// Transport name as it appears in request paths.
    pub fn name(&self) -> &'static str {
        if self.persistent {
            XHR_STREAMING
        } else {
            XHR_POLLING
        }
    }

    /// True for `xhr-streaming`.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Serves a request addressed to this transport.
    ///
    /// Without a session id the request is a handshake; with one it is a
    /// continuation handed to the session's bound handler.
    pub async fn handle(
        &self,
        registry: &SessionRegistry,
        factory: &dyn InboundFactory,
        handshake: &HandshakeRequest,
        session_id: Option<&str>,
        request: PollRequest,
    ) -> PollResponse {
        let Some(id) = session_id else {
            if request.method != Method::GET {
                return PollResponse::Error(StatusCode::BAD_REQUEST, "Handshake must be a GET");
            }
            return match factory.accept(handshake) {
                Some(inbound) => self.connect(registry, inbound).await,
                None => {
                    info!(transport = self.name(), "handshake refused by application");
                    PollResponse::Error(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
                }
            };
        };

        let Some(session) = registry.get_session(id) else {
            debug!(session = id, "request for unknown session");
            return PollResponse::Error(StatusCode::FORBIDDEN, "Unknown session");
        };
        match session.transport_handler() {
            Some(handler) => handler.handle(request).await,
            None => {
                warn!(session = id, "session has no transport handler");
                session.on_shutdown().await;
                PollResponse::Error(StatusCode::INTERNAL_SERVER_ERROR, "Session has no transport")
            }
        }
    }

    /// Creates a session for `inbound` and answers the handshake.
    pub async fn connect(&self, registry: &SessionRegistry, inbound: Arc<dyn Inbound>) -> PollResponse {
        let session = registry.create_session(inbound);
        let handler = LongPollHandler::new(session, &self.config, self.persistent);
        handler.connect().await
    }
}

struct PollState {
    open: bool,
    aborted: bool,
    disconnect_when_empty: bool,
    poll: Option<u64>,
    next_poll: u64,
}

/// Per-session long-polling handler.
pub struct LongPollHandler {
    session: Arc<Session>,
    buffer: TransportBuffer,
    persistent: bool,
    max_idle: Duration,
    poll_timeout: Duration,
    state: Mutex<PollState>,
    wake: Notify,
    me: Weak<LongPollHandler>,
}

impl std::fmt::Debug for LongPollHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollHandler")
            .field("session", self.session.id())
            .field("persistent", &self.persistent)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl LongPollHandler {
    /// Creates a handler for `session` and configures the session timers.
    pub fn new(session: Arc<Session>, config: &TransportConfig, persistent: bool) -> Arc<Self> {
        if persistent {
            session.set_heartbeat(config.heartbeat_delay());
            session.set_timeout(config.heartbeat_timeout());
        } else {
            session.set_heartbeat(Duration::ZERO);
            session.set_timeout(config.between_polls_timeout());
        }
        Arc::new_cyclic(|me| LongPollHandler {
            session,
            buffer: TransportBuffer::new(config.buffer_size),
            persistent,
            max_idle: config.max_idle_time(),
            poll_timeout: config.poll_timeout(),
            state: Mutex::new(PollState {
                open: false,
                aborted: false,
                disconnect_when_empty: false,
                poll: None,
                next_poll: 0,
            }),
            wake: Notify::new(),
            me: me.clone(),
        })
    }

    /// The session this handler serves.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn connect(self: Arc<Self>) -> PollResponse {
        let interval = if self.persistent {
            self.session.heartbeat()
        } else {
            self.poll_timeout
        };
        let handshake = protocol::encode_all(&[
            Frame::session_id(self.session.id().as_str()),
            Frame::heartbeat_interval(interval),
        ]);

        self.state.lock().open = true;
        if self.persistent {
            // An empty buffer takes any item, so this never waits.
            self.buffer.put(handshake.clone(), self.max_idle).await;
        }

        let handler: Arc<dyn TransportHandler> = self.clone();
        if let Err(e) = self.session.on_connect(handler).await {
            warn!(session = %self.session.id(), error = %e, "handshake failed");
            self.abort().await;
            return PollResponse::Error(StatusCode::INTERNAL_SERVER_ERROR, "Handshake failed");
        }

        if !self.persistent {
            self.session.start_timeout_timer();
            return PollResponse::Payload(handshake);
        }
        let me = self.me.clone();
        PollResponse::Stream(PollStream::new(stream_chunks(self.clone()), move || {
            let Some(handler) = me.upgrade() else {
                return;
            };
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { handler.on_stream_closed().await });
            }
        }))
    }

    /// Next chunk of a held-open response: everything buffered since the last
    /// one. `None` once the handler is torn down.
    async fn next_stream_chunk(&self) -> Option<Bytes> {
        loop {
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            let payload = self.buffer.drain_joined();
            if !payload.is_empty() {
                return Some(Bytes::from(payload));
            }
            let (aborted, drained) = {
                let state = self.state.lock();
                (state.aborted, state.disconnect_when_empty)
            };
            if aborted {
                return None;
            }
            if drained {
                self.abort().await;
                return None;
            }

            tokio::select! {
                _ = self.buffer.wait_non_empty() => {}
                _ = &mut woken => {}
            }
        }
    }

    async fn handle_get(&self) -> PollResponse {
        if self.persistent {
            return PollResponse::Empty(StatusCode::NOT_FOUND);
        }

        let poll = {
            let mut state = self.state.lock();
            if !state.open && self.buffer.is_empty() {
                return PollResponse::Empty(StatusCode::NOT_FOUND);
            }
            state.next_poll += 1;
            let poll = state.next_poll;
            if state.poll.replace(poll).is_some() {
                debug!(session = %self.session.id(), "superseding suspended poll");
                self.wake.notify_waiters();
            }
            poll
        };

        if !self.buffer.is_empty() {
            return self.complete_poll(poll).await;
        }

        self.session.clear_timeout_timer();
        let mut guard = PollGuard {
            handler: self,
            poll,
            armed: true,
        };

        let woken = self.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();

        let still_owner = self.state.lock().poll == Some(poll);
        if still_owner {
            debug!(session = %self.session.id(), "suspending poll");
            tokio::select! {
                _ = self.buffer.wait_non_empty() => {}
                _ = &mut woken => {}
                _ = tokio::time::sleep(self.poll_timeout) => {}
            }
        }

        guard.armed = false;
        self.complete_poll(poll).await
    }

    /// Answers poll `poll` with everything buffered. A poll that was
    /// superseded, or whose handler was aborted meanwhile, gets an empty body.
    async fn complete_poll(&self, poll: u64) -> PollResponse {
        {
            let mut state = self.state.lock();
            if state.poll != Some(poll) {
                return PollResponse::Payload(String::new());
            }
            state.poll = None;
        }

        let payload = self.buffer.drain_joined();
        self.after_poll().await;
        PollResponse::Payload(payload)
    }

    async fn after_poll(&self) {
        let (drained, open) = {
            let state = self.state.lock();
            (
                state.disconnect_when_empty && self.buffer.is_empty(),
                state.open,
            )
        };
        if drained {
            self.abort().await;
        } else if open {
            self.session.start_timeout_timer();
        }
    }

    fn poll_dropped(&self, poll: u64) {
        let open = {
            let mut state = self.state.lock();
            if state.poll != Some(poll) {
                return;
            }
            state.poll = None;
            state.open
        };
        debug!(session = %self.session.id(), "poll abandoned by client");
        if open {
            self.session.start_timeout_timer();
        }
    }

    async fn handle_post(&self, request: PollRequest) -> PollResponse {
        if !self.state.lock().open {
            return PollResponse::Empty(StatusCode::OK);
        }
        if request.body.is_empty() {
            return PollResponse::Error(StatusCode::BAD_REQUEST, "Empty POST body");
        }

        let text = match post_payload(&request) {
            Ok(text) => text,
            Err(reason) => {
                warn!(session = %self.session.id(), reason, "unreadable POST body");
                return PollResponse::Error(StatusCode::BAD_REQUEST, reason);
            }
        };
        match protocol::decode(&text) {
            Ok(frames) => self.session.on_messages(frames).await,
            Err(e) => warn!(session = %self.session.id(), error = %e, "discarding undecodable POST"),
        }

        let drained = {
            let state = self.state.lock();
            state.disconnect_when_empty && self.buffer.is_empty()
        };
        if drained {
            self.abort().await;
        }
        PollResponse::Empty(StatusCode::OK)
    }

    async fn on_stream_closed(&self) {
        let report = {
            let state = self.state.lock();
            if state.aborted {
                return;
            }
            !state.disconnect_when_empty
        };
        info!(session = %self.session.id(), "streaming response closed");
        if report {
            self.session.on_disconnect(DisconnectReason::Disconnect).await;
        }
        self.abort().await;
    }
}

/// Completes an abandoned suspended poll when the request future is dropped.
struct PollGuard<'a> {
    handler: &'a LongPollHandler,
    poll: u64,
    armed: bool,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        if self.armed && tokio::runtime::Handle::try_current().is_ok() {
            self.handler.poll_dropped(self.poll);
        }
    }
}

#[async_trait]
impl TransportHandler for LongPollHandler {
    fn transport_name(&self) -> &'static str {
        if self.persistent {
            XHR_STREAMING
        } else {
            XHR_POLLING
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.state.lock().open {
            return Err(TransportError::Closed);
        }

        if !self.buffer.put(frame.encode(), self.max_idle).await {
            warn!(session = %self.session.id(), "outbound buffer stayed full, client stopped reading");
            self.session.on_disconnect(DisconnectReason::Timeout).await;
            self.abort().await;
            return Err(TransportError::BackpressureTimeout {
                waited_ms: self.max_idle.as_millis() as u64,
            });
        }
        if self.persistent {
            self.session.start_heartbeat_timer();
        }
        Ok(())
    }

    async fn send_message(&self, message_type: MessageType, message: String) -> Result<()> {
        if !self.state.lock().open {
            return Err(TransportError::Closed);
        }
        if self.session.connection_state() != ConnectionState::Connected {
            return Err(TransportError::Closed);
        }
        self.send_frame(Frame::data(message_type, message)).await
    }

    async fn handle(&self, request: PollRequest) -> PollResponse {
        match request.method {
            Method::GET => self.handle_get().await,
            Method::POST => self.handle_post(request).await,
            _ => PollResponse::Error(StatusCode::BAD_REQUEST, "Unsupported method"),
        }
    }

    async fn disconnect(&self) {
        self.session.on_disconnect(DisconnectReason::Disconnect).await;
        self.abort().await;
    }

    async fn close(&self) {
        self.session.start_close().await;
    }

    async fn abort(&self) {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.open = false;
            state.poll = None;
        }
        self.wake.notify_waiters();
        self.session.clear_heartbeat_timer();
        self.session.clear_timeout_timer();
        self.buffer.reject_all();
        self.buffer.clear();
        debug!(session = %self.session.id(), "polling handler aborted");
        self.session.on_shutdown().await;
    }

    fn disconnect_when_empty(&self) {
        self.state.lock().disconnect_when_empty = true;
    }
}

/// Body of a held-open response, pulled from the handler's buffer as the
/// client reads.
fn stream_chunks(handler: Arc<LongPollHandler>) -> impl Stream<Item = Bytes> + Send {
    futures::stream::unfold(handler, |handler| async move {
        let chunk = handler.next_stream_chunk().await?;
        Some((chunk, handler))
    })
}

fn post_payload(request: &PollRequest) -> std::result::Result<String, &'static str> {
    let body = std::str::from_utf8(&request.body).map_err(|_| "POST body is not UTF-8")?;
    let is_form = request
        .content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
        .unwrap_or(false);
    if !is_form {
        return Ok(body.to_string());
    }

    let field = body
        .split('&')
        .find_map(|pair| pair.strip_prefix("data="))
        .ok_or("Missing data field")?;
    urlencoding::decode(&field.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|_| "Malformed form data")
}
