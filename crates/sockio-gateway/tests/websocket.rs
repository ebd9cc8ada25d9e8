//! Integration tests for the websocket transport over a loopback listener.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{gateway, RecordingFactory};
use futures::{SinkExt, StreamExt};
use sockio_gateway::{Gateway, GatewayConfig};
use sockio_transport::{protocol, Frame, FrameType};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn(gateway: &Gateway) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway.router();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    addr
}

async fn next_frames(client: &mut Client) -> Vec<Frame> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no message within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return protocol::decode(&text).unwrap();
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_handshake_and_message_exchange() {
    let (gateway, factory) = gateway(GatewayConfig::default());
    let addr = spawn(&gateway).await;
    let (mut client, _) = connect_async(format!("ws://{}/socket.io/websocket", addr))
        .await
        .unwrap();

    client.send(Message::Text("OPEN".to_string())).await.unwrap();
    let id_frames = next_frames(&mut client).await;
    assert_eq!(id_frames[0].frame_type(), FrameType::SessionId);
    let interval = next_frames(&mut client).await;
    assert_eq!(interval, vec![Frame::heartbeat_interval(Duration::from_secs(150))]);
    assert!(gateway.registry().get_session(id_frames[0].payload()).is_some());

    let batch = protocol::encode_all(&[Frame::text("hello"), Frame::text("world")]);
    client.send(Message::Text(batch)).await.unwrap();
    let inbound = factory.last();
    wait_until(|| inbound.events().len() == 3).await;
    assert_eq!(inbound.events(), vec!["connect", "message:hello", "message:world"]);

    inbound.outbound().send_message("from server").await.unwrap();
    assert_eq!(next_frames(&mut client).await, vec![Frame::text("from server")]);

    client.send(Message::Ping(vec![1])).await.unwrap();
    client.close(None).await.unwrap();
    wait_until(|| gateway.registry().is_empty()).await;
    assert_eq!(inbound.events().last().unwrap(), "disconnect:ERROR");
}

#[tokio::test]
async fn test_bad_handshake_closes_socket() {
    let (gateway, factory) = gateway(GatewayConfig::default());
    let addr = spawn(&gateway).await;
    let (mut client, _) = connect_async(format!("ws://{}/socket.io/websocket", addr))
        .await
        .unwrap();

    client.send(Message::Text("HELLO".to_string())).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = client.next().await {
            if message.is_close() {
                return true;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    wait_until(|| gateway.registry().is_empty()).await;
    assert!(factory.last().events().is_empty());
}

#[tokio::test]
async fn test_server_disconnect_sends_close_frame() {
    let (gateway, factory) = gateway(GatewayConfig::default());
    let addr = spawn(&gateway).await;
    let (mut client, _) = connect_async(format!("ws://{}/socket.io/websocket", addr))
        .await
        .unwrap();
    client.send(Message::Text("OPEN".to_string())).await.unwrap();
    next_frames(&mut client).await;
    next_frames(&mut client).await;

    let inbound = factory.last();
    wait_until(|| !inbound.events().is_empty()).await;
    inbound.outbound().disconnect().await;

    assert_eq!(next_frames(&mut client).await, vec![Frame::close("server")]);
    assert_eq!(inbound.events(), vec!["connect", "disconnect:DISCONNECT"]);
    assert!(gateway.registry().is_empty());
}

#[tokio::test]
async fn test_first_offered_protocol_is_echoed() {
    let (gateway, _factory) = gateway(GatewayConfig::default());
    let addr = spawn(&gateway).await;

    let mut request = format!("ws://{}/socket.io/websocket", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "chat, superchat".parse().unwrap());
    let (_client, response) = connect_async(request).await.unwrap();
    assert_eq!(response.headers()["sec-websocket-protocol"], "chat");
}

#[tokio::test]
async fn test_rejected_origin_is_forbidden() {
    let (gateway, _factory) = gateway(GatewayConfig::default());
    let gateway = gateway.with_origin_check(Arc::new(|_: Option<&str>, _: Option<&str>| -> Option<String> { None }));
    let addr = spawn(&gateway).await;

    let err = connect_async(format!("ws://{}/socket.io/websocket", addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 403),
        other => panic!("expected HTTP 403, got {:?}", other),
    }
    assert!(gateway.registry().is_empty());
}

#[tokio::test]
async fn test_refused_handshake_is_unavailable() {
    let gateway = Gateway::new(GatewayConfig::default(), Arc::new(RecordingFactory::refusing()));
    let addr = spawn(&gateway).await;

    let err = connect_async(format!("ws://{}/socket.io/websocket", addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP 503, got {:?}", other),
    }
}
