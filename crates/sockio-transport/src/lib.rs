#![warn(missing_docs)]

//! sockio transport subsystem: session state machine, long-polling and websocket handlers, frame codec

pub mod buffer;
pub mod config;
pub mod error;
pub mod inbound;
pub mod keepalive;
pub mod origin;
pub mod polling;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod websocket;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use inbound::{HandshakeRequest, Inbound, InboundFactory, Outbound};
pub use origin::{EchoOrigin, OriginCheck};
pub use polling::{LongPollTransport, XHR_POLLING, XHR_STREAMING};
pub use protocol::{Frame, FrameType, MessageType};
pub use registry::SessionRegistry;
pub use session::{ConnectionState, DisconnectReason, Session, SessionId};
pub use transport::{PollRequest, PollResponse, PollStream, TransportHandler};
pub use websocket::{SocketCommand, WebSocketHandler, WebSocketTransport, WEBSOCKET};
