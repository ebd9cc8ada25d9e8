//! Echo application served by the gateway binary.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use sockio_transport::{
    DisconnectReason, HandshakeRequest, Inbound, InboundFactory, MessageType, Outbound,
};
use tracing::{debug, info, warn};

/// Sends every message back to the client that sent it.
#[derive(Debug, Default)]
pub struct EchoInbound {
    outbound: OnceLock<Outbound>,
}

#[async_trait]
impl Inbound for EchoInbound {
    async fn on_connect(&self, outbound: Outbound) {
        info!(session = %outbound.session_id(), "echo client connected");
        let _ = self.outbound.set(outbound);
    }

    async fn on_message(&self, message_type: MessageType, message: String) {
        let Some(outbound) = self.outbound.get() else {
            return;
        };
        debug!(session = %outbound.session_id(), ?message_type, "echoing message");
        if let Err(e) = outbound.send_typed(message_type, message).await {
            warn!(session = %outbound.session_id(), error = %e, "echo failed");
        }
    }

    async fn on_disconnect(&self, reason: DisconnectReason, detail: Option<String>) {
        let session = self.outbound.get().map(|o| o.session_id().to_string());
        info!(session = ?session, %reason, detail = ?detail, "echo client disconnected");
    }
}

/// Accepts every handshake with a fresh [`EchoInbound`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoFactory;

impl InboundFactory for EchoFactory {
    fn accept(&self, request: &HandshakeRequest) -> Option<Arc<dyn Inbound>> {
        debug!(transport = %request.transport, "accepting echo session");
        Some(Arc::new(EchoInbound::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockio_transport::{protocol, LongPollTransport, PollRequest, PollResponse, SessionRegistry, TransportConfig};

    #[tokio::test]
    async fn test_echo_round_trip_over_polling() {
        let registry = SessionRegistry::new();
        let transport = LongPollTransport::single_shot(TransportConfig::default());
        let factory = EchoFactory;
        let handshake = HandshakeRequest::new("xhr-polling");

        let PollResponse::Payload(body) = transport
            .handle(&registry, &factory, &handshake, None, PollRequest::get())
            .await
        else {
            panic!("handshake must return a payload");
        };
        let frames = protocol::decode(&body).unwrap();
        let id = frames[0].payload().to_string();

        let post = protocol::Frame::text("ping").encode();
        transport
            .handle(&registry, &factory, &handshake, Some(&id), PollRequest::post(post))
            .await;
        let PollResponse::Payload(body) = transport
            .handle(&registry, &factory, &handshake, Some(&id), PollRequest::get())
            .await
        else {
            panic!("poll must return a payload");
        };
        assert_eq!(protocol::decode(&body).unwrap(), vec![protocol::Frame::text("ping")]);
    }
}
