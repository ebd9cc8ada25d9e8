//! Common test utilities and fixtures for gateway integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use sockio_gateway::{Gateway, GatewayConfig};
use sockio_transport::{
    protocol, DisconnectReason, Frame, FrameType, HandshakeRequest, Inbound, InboundFactory,
    MessageType, Outbound, TransportConfig,
};
use tower::ServiceExt;

/// Application sink recording every callback.
#[derive(Default)]
pub struct RecordingInbound {
    events: Mutex<Vec<String>>,
    outbound: Mutex<Option<Outbound>>,
}

impl RecordingInbound {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound
            .lock()
            .unwrap()
            .clone()
            .expect("session not connected")
    }
}

#[async_trait]
impl Inbound for RecordingInbound {
    async fn on_connect(&self, outbound: Outbound) {
        self.events.lock().unwrap().push("connect".to_string());
        *self.outbound.lock().unwrap() = Some(outbound);
    }

    async fn on_message(&self, _message_type: MessageType, message: String) {
        self.events.lock().unwrap().push(format!("message:{}", message));
    }

    async fn on_disconnect(&self, reason: DisconnectReason, _detail: Option<String>) {
        self.events.lock().unwrap().push(format!("disconnect:{}", reason));
    }
}

/// Factory handing out recording sinks, or refusing every handshake.
#[derive(Default)]
pub struct RecordingFactory {
    pub refuse: bool,
    accepted: Mutex<Vec<Arc<RecordingInbound>>>,
}

impl RecordingFactory {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Sink of the most recently accepted session.
    pub fn last(&self) -> Arc<RecordingInbound> {
        self.accepted
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session accepted")
    }
}

impl InboundFactory for RecordingFactory {
    fn accept(&self, _request: &HandshakeRequest) -> Option<Arc<dyn Inbound>> {
        if self.refuse {
            return None;
        }
        let inbound = Arc::new(RecordingInbound::default());
        self.accepted.lock().unwrap().push(inbound.clone());
        Some(inbound)
    }
}

/// Fast timings: 100ms between polls, 200ms poll timeout.
pub fn fast_config() -> GatewayConfig {
    GatewayConfig {
        transport: TransportConfig {
            poll_timeout_ms: 200,
            http_request_timeout_ms: 400,
            ..TransportConfig::default()
        },
        ..GatewayConfig::default()
    }
}

pub fn gateway(config: GatewayConfig) -> (Gateway, Arc<RecordingFactory>) {
    let factory = Arc::new(RecordingFactory::default());
    (Gateway::new(config, factory.clone()), factory)
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl TestResponse {
    pub fn frames(&self) -> Vec<Frame> {
        protocol::decode(&self.body).expect("response body must decode")
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter(|f| f.frame_type() == FrameType::Data)
            .map(Frame::into_payload)
            .collect()
    }
}

pub async fn request(router: &Router, method: Method, uri: &str, body: impl Into<Body>) -> TestResponse {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "localhost")
        .header("content-type", "text/plain; charset=UTF-8")
        .body(body.into())
        .unwrap();
    send(router, request).await
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    TestResponse {
        status,
        headers,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

/// Performs an `xhr-polling` handshake and returns the session id.
pub async fn handshake(router: &Router) -> String {
    let response = request(router, Method::GET, "/socket.io/xhr-polling", Body::empty()).await;
    assert_eq!(response.status, StatusCode::OK);
    let frames = response.frames();
    assert_eq!(frames[0].frame_type(), FrameType::SessionId);
    frames[0].payload().to_string()
}
