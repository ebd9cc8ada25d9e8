//! Socket pump between an upgraded axum socket and a [`WebSocketHandler`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use sockio_transport::{SocketCommand, WebSocketHandler};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Runs the socket until either side closes it.
///
/// Commands from the handler are written by a separate task; inbound text is
/// fed to the handler in arrival order. The socket is dropped after `idle`
/// without inbound data, or after `handshake` if the handshake token never
/// arrives. A writer stuck on a client that stopped reading gets `handshake`
/// to finish before it is cancelled.
pub async fn pump(
    socket: WebSocket,
    handler: Arc<WebSocketHandler>,
    mut commands: mpsc::Receiver<SocketCommand>,
    idle: Duration,
    handshake: Duration,
) {
    let session = handler.session().id().clone();
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                SocketCommand::Send(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(error = %e, "socket write failed");
                        break;
                    }
                }
                SocketCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut writer_done = false;
    loop {
        let limit = if handler.is_initiated() { idle } else { handshake };
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            next = tokio::time::timeout(limit, stream.next()) => match next {
                Err(_) => {
                    info!(session = %session, "socket idle, closing");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!(session = %session, error = %e, "socket read failed");
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => handler.on_text(&text).await,
                Ok(Some(Ok(_))) => {}
            },
        }
    }

    handler.on_close().await;
    if !writer_done && tokio::time::timeout(handshake, &mut writer).await.is_err() {
        debug!(session = %session, "socket writer stalled, cancelling");
        writer.abort();
    }
    debug!(session = %session, "socket pump finished");
}
