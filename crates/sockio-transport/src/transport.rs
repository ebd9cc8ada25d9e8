//! The contract between a session and its physical transport.
//!
//! A session only ever talks to a `dyn TransportHandler`; the long-polling
//! and websocket handlers implement it independently.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use http::{Method, StatusCode};

use crate::error::Result;
use crate::protocol::{Frame, MessageType};

/// Operations a session performs on whatever transport it is bound to.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Transport name as it appears in request paths.
    fn transport_name(&self) -> &'static str;

    /// Writes an encoded frame, or queues it until the next poll.
    async fn send_frame(&self, frame: Frame) -> Result<()>;

    /// Sends an application message; fails once the session left `Connected`.
    async fn send_message(&self, message_type: MessageType, message: String) -> Result<()>;

    /// Serves a continuation request addressed to this session.
    async fn handle(&self, request: PollRequest) -> PollResponse;

    /// Reports `Disconnect` to the application and tears the transport down.
    async fn disconnect(&self);

    /// Starts a graceful close.
    async fn close(&self);

    /// Tears the transport down and shuts the session down. Idempotent.
    async fn abort(&self);

    /// Aborts once all queued outbound data has been delivered.
    fn disconnect_when_empty(&self);
}

/// The parts of an HTTP request a transport needs.
#[derive(Debug, Clone)]
pub struct PollRequest {
    /// Request method.
    pub method: Method,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Full request body.
    pub body: Bytes,
}

impl PollRequest {
    /// A body-less `GET`.
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            content_type: None,
            body: Bytes::new(),
        }
    }

    /// A `text/plain` `POST`.
    pub fn post(body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            content_type: Some("text/plain; charset=UTF-8".to_string()),
            body: body.into(),
        }
    }
}

/// What the HTTP layer should answer.
#[derive(Debug)]
pub enum PollResponse {
    /// Status with an empty body.
    Empty(StatusCode),
    /// Error status with a short reason.
    Error(StatusCode, &'static str),
    /// `200` with encoded frames.
    Payload(String),
    /// `200` with a body that stays open and receives frames as they are sent.
    Stream(PollStream),
}

impl PollResponse {
    /// HTTP status of the response.
    pub fn status(&self) -> StatusCode {
        match self {
            PollResponse::Empty(status) | PollResponse::Error(status, _) => *status,
            PollResponse::Payload(_) | PollResponse::Stream(_) => StatusCode::OK,
        }
    }
}

/// Held-open response body of a persistent poll.
///
/// Yields chunks as the handler produces them and ends when the handler is
/// torn down. Chunks are only produced while the body is being read, so a
/// client that stops reading leaves its frames in the handler's bounded
/// buffer. Dropping the stream (the client went away) runs the close hook.
pub struct PollStream {
    chunks: BoxStream<'static, Bytes>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl PollStream {
    /// Wraps a chunk source with a hook run when the stream is dropped.
    pub fn new(
        chunks: impl Stream<Item = Bytes> + Send + 'static,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            chunks: chunks.boxed(),
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Receives the next chunk, or `None` once the handler closed the stream.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.chunks.next().await
    }
}

impl std::fmt::Debug for PollStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollStream").finish_non_exhaustive()
    }
}

impl Stream for PollStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_next_unpin(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for PollStream {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_response_status() {
        assert_eq!(PollResponse::Payload(String::new()).status(), StatusCode::OK);
        assert_eq!(
            PollResponse::Error(StatusCode::FORBIDDEN, "unknown session").status(),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_then_runs_close_hook() {
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = closed.clone();
        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let mut stream = PollStream::new(chunks, move || flag.store(true, Ordering::SeqCst));

        tx.send(Bytes::from_static(b"~1~1~a")).unwrap();
        drop(tx);
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"~1~1~a"));
        assert!(stream.next().await.is_none());
        assert!(!closed.load(Ordering::SeqCst));

        drop(stream);
        assert!(closed.load(Ordering::SeqCst));
    }
}
