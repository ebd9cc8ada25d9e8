//! HTTP front-end: path routing, transport dispatch and CORS headers.
//!
//! Requests under the configured prefix are routed by path:
//!
//! ```text
//! <prefix>/<transport>[/<session id>[/...]]
//! ```
//!
//! A request without a session id is a handshake.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use sockio_transport::{
    EchoOrigin, HandshakeRequest, InboundFactory, LongPollTransport, OriginCheck, PollRequest,
    PollResponse, SessionRegistry, WebSocketTransport, WEBSOCKET, XHR_POLLING, XHR_STREAMING,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::ws;

/// Shared state of all request handlers.
#[derive(Clone)]
pub struct GatewayState {
    prefix: String,
    registry: SessionRegistry,
    factory: Arc<dyn InboundFactory>,
    origin: Arc<dyn OriginCheck>,
    polling: LongPollTransport,
    streaming: LongPollTransport,
    websocket: WebSocketTransport,
}

/// The gateway: a session registry plus the HTTP surface in front of it.
pub struct Gateway {
    config: GatewayConfig,
    state: Arc<GatewayState>,
}

impl Gateway {
    /// Creates a gateway whose sessions are accepted by `factory`.
    pub fn new(config: GatewayConfig, factory: Arc<dyn InboundFactory>) -> Self {
        let state = GatewayState {
            prefix: config.normalized_prefix().to_string(),
            registry: SessionRegistry::new(),
            factory,
            origin: Arc::new(EchoOrigin),
            polling: LongPollTransport::single_shot(config.transport.clone()),
            streaming: LongPollTransport::persistent(config.transport.clone()),
            websocket: WebSocketTransport::new(config.transport.clone()),
        };
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Replaces the default origin check.
    ///
    /// Applies to routers built afterwards; sessions stay shared with routers
    /// built earlier.
    pub fn with_origin_check(mut self, origin: Arc<dyn OriginCheck>) -> Self {
        Arc::make_mut(&mut self.state).origin = origin;
        self
    }

    /// Registry of the sessions served by this gateway.
    pub fn registry(&self) -> &SessionRegistry {
        &self.state.registry
    }

    /// Builds the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr;
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Gateway listening on {}{}", addr, self.state.prefix);

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Outside,
    MissingTransport,
    Transport {
        name: &'a str,
        session_id: Option<&'a str>,
    },
}

fn route<'a>(prefix: &str, path: &'a str) -> Route<'a> {
    let rest = if prefix == "/" {
        path
    } else {
        match path.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return Route::Outside,
        }
    };

    let mut segments = rest.trim_start_matches('/').splitn(3, '/');
    let name = segments.next().unwrap_or_default();
    if name.is_empty() {
        return Route::MissingTransport;
    }
    let session_id = segments.next().filter(|id| !id.is_empty());
    Route::Transport { name, session_id }
}

async fn handle_request(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
    body: Bytes,
) -> Response {
    let (transport, session_id) = match route(&state.prefix, uri.path()) {
        Route::Outside => return StatusCode::NOT_FOUND.into_response(),
        Route::MissingTransport => {
            return (StatusCode::BAD_REQUEST, "Missing transport").into_response()
        }
        Route::Transport { name, session_id } => (name, session_id),
    };

    let accepted_origin = state.origin.check_origin(
        header_str(&headers, header::HOST),
        header_str(&headers, header::ORIGIN),
    );

    if method == Method::OPTIONS {
        return with_cors(StatusCode::OK.into_response(), accepted_origin.as_deref());
    }

    let polling = match transport {
        XHR_POLLING => &state.polling,
        XHR_STREAMING => &state.streaming,
        WEBSOCKET => {
            return websocket(&state, method, session_id, headers, upgrade, accepted_origin)
        }
        other => {
            debug!(transport = other, "unknown transport requested");
            return (StatusCode::BAD_REQUEST, "Unknown transport").into_response();
        }
    };

    let request = PollRequest {
        content_type: header_str(&headers, header::CONTENT_TYPE).map(str::to_string),
        method,
        body,
    };
    let handshake = HandshakeRequest {
        transport: transport.to_string(),
        headers,
        protocol: None,
    };
    let response = polling
        .handle(
            &state.registry,
            state.factory.as_ref(),
            &handshake,
            session_id,
            request,
        )
        .await;
    with_cors(poll_response(response), accepted_origin.as_deref())
}

fn websocket(
    state: &GatewayState,
    method: Method,
    session_id: Option<&str>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
    accepted_origin: Option<String>,
) -> Response {
    let upgrade = match upgrade {
        Some(upgrade) if WebSocketTransport::validate_upgrade(&method, session_id, &headers) => upgrade,
        _ => return (StatusCode::BAD_REQUEST, "Invalid websocket transport request").into_response(),
    };
    let Some(origin) = accepted_origin else {
        warn!("websocket origin rejected");
        return (StatusCode::FORBIDDEN, "Origin rejected").into_response();
    };

    let protocol = WebSocketTransport::offered_protocols(&headers).into_iter().next();
    let handshake = HandshakeRequest {
        transport: WEBSOCKET.to_string(),
        headers,
        protocol: protocol.clone(),
    };
    let Some(inbound) = state.factory.accept(&handshake) else {
        info!(transport = WEBSOCKET, "handshake refused by application");
        return (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response();
    };

    let (handler, commands) = state.websocket.accept(&state.registry, inbound);
    debug!(session = %handler.session().id(), %origin, "upgrading to websocket");

    let upgrade = match protocol {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };
    let idle = state.websocket.idle_timeout();
    let handshake_timeout = state.websocket.handshake_timeout();
    let failed = handler.clone();
    upgrade
        .on_failed_upgrade(move |e| {
            warn!(error = %e, "websocket upgrade failed");
            tokio::spawn(async move { failed.on_close().await });
        })
        .on_upgrade(move |socket| ws::pump(socket, handler, commands, idle, handshake_timeout))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn poll_response(response: PollResponse) -> Response {
    const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
    match response {
        PollResponse::Empty(status) => status.into_response(),
        PollResponse::Error(status, reason) => (status, reason).into_response(),
        PollResponse::Payload(body) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
        }
        PollResponse::Stream(stream) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, TEXT_PLAIN),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response(),
    }
}

fn with_cors(mut response: Response, origin: Option<&str>) -> Response {
    let Some(origin) = origin.and_then(|o| HeaderValue::from_str(o).ok()) else {
        return response;
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    response
}
