//! Wire framing for the session protocol.
//!
//! Every frame is self-delimiting:
//!
//! ```text
//! ~<type hex>~<body length hex>~<body>
//! ```
//!
//! The length counts UTF-8 bytes of the body, so a body may contain any
//! character including the `~` delimiter. A `DATA` body additionally carries
//! its message type: `<message type hex>~<text>`. Any number of frames may be
//! concatenated into one physical payload (a poll response, a POST body or a
//! socket message); [`decode`] recovers them in order.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Delimiter between the fields of a frame.
pub const FRAME_DELIMITER: char = '~';

/// Literal first message of a full-duplex handshake.
pub const HANDSHAKE_TOKEN: &str = "OPEN";

/// Longest accepted hex field (type, length, message type).
const MAX_FIELD_DIGITS: usize = 8;

/// Frame types of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Graceful close request or acknowledgement.
    Close = 0x0,
    /// Session id assigned at handshake, first frame of every handshake.
    SessionId = 0x1,
    /// Heartbeat interval in milliseconds, second frame of every handshake.
    HeartbeatInterval = 0x2,
    /// Liveness check, answered with a pong carrying the same body.
    Ping = 0x3,
    /// Answer to a ping.
    Pong = 0x4,
    /// Server heartbeat, echoed by the client.
    Heartbeat = 0x5,
    /// Application message.
    Data = 0xE,
}

impl FrameType {
    /// Raw wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a raw wire value.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(FrameType::Close),
            0x1 => Some(FrameType::SessionId),
            0x2 => Some(FrameType::HeartbeatInterval),
            0x3 => Some(FrameType::Ping),
            0x4 => Some(FrameType::Pong),
            0x5 => Some(FrameType::Heartbeat),
            0xE => Some(FrameType::Data),
            _ => None,
        }
    }
}

/// Subtype of a `DATA` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    /// Plain UTF-8 text.
    #[default]
    Text = 0x0,
    /// Text holding a JSON document.
    Json = 0x1,
}

impl MessageType {
    /// Raw wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a raw wire value.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(MessageType::Text),
            0x1 => Some(MessageType::Json),
            _ => None,
        }
    }
}

/// One typed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    message_type: MessageType,
    data: String,
}

impl Frame {
    /// Creates a frame. The message type is only kept for `DATA` frames.
    pub fn new(frame_type: FrameType, message_type: MessageType, data: impl Into<String>) -> Self {
        let message_type = if frame_type == FrameType::Data {
            message_type
        } else {
            MessageType::Text
        };
        Self {
            frame_type,
            message_type,
            data: data.into(),
        }
    }

    /// Application message frame.
    pub fn data(message_type: MessageType, data: impl Into<String>) -> Self {
        Self::new(FrameType::Data, message_type, data)
    }

    /// Text application message frame.
    pub fn text(data: impl Into<String>) -> Self {
        Self::data(MessageType::Text, data)
    }

    /// Session id announcement.
    pub fn session_id(id: impl Into<String>) -> Self {
        Self::new(FrameType::SessionId, MessageType::Text, id)
    }

    /// Heartbeat interval announcement, in milliseconds.
    pub fn heartbeat_interval(interval: Duration) -> Self {
        Self::new(
            FrameType::HeartbeatInterval,
            MessageType::Text,
            interval.as_millis().to_string(),
        )
    }

    /// Heartbeat carrying a sequence number.
    pub fn heartbeat(seq: u64) -> Self {
        Self::new(FrameType::Heartbeat, MessageType::Text, seq.to_string())
    }

    /// Close frame carrying the close id.
    pub fn close(close_id: impl Into<String>) -> Self {
        Self::new(FrameType::Close, MessageType::Text, close_id)
    }

    /// Ping frame.
    pub fn ping(data: impl Into<String>) -> Self {
        Self::new(FrameType::Ping, MessageType::Text, data)
    }

    /// Pong frame.
    pub fn pong(data: impl Into<String>) -> Self {
        Self::new(FrameType::Pong, MessageType::Text, data)
    }

    /// Frame type.
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Message type, always `Text` for non-`DATA` frames.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Frame body without the message type prefix.
    pub fn payload(&self) -> &str {
        &self.data
    }

    /// Consumes the frame, returning its body.
    pub fn into_payload(self) -> String {
        self.data
    }

    /// Encodes the frame into its wire form.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 12);
        self.encode_into(&mut out);
        out
    }

    /// Appends the wire form of the frame to `out`.
    pub fn encode_into(&self, out: &mut String) {
        use std::fmt::Write;

        let prefix = if self.frame_type == FrameType::Data {
            format!("{:x}{}", self.message_type.as_u8(), FRAME_DELIMITER)
        } else {
            String::new()
        };
        let body_len = prefix.len() + self.data.len();
        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "{d}{:x}{d}{:x}{d}",
            self.frame_type.as_u8(),
            body_len,
            d = FRAME_DELIMITER
        );
        out.push_str(&prefix);
        out.push_str(&self.data);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.frame_type, self.data)
    }
}

/// Encodes frames into a single physical payload.
pub fn encode_all<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> String {
    let mut out = String::new();
    for frame in frames {
        frame.encode_into(&mut out);
    }
    out
}

/// Decodes a physical payload into its frames, in order.
pub fn decode(input: &str) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        rest = rest
            .strip_prefix(FRAME_DELIMITER)
            .ok_or_else(|| invalid("expected frame delimiter"))?;

        let (raw_type, after_type) = split_field(rest)?;
        let raw_type = parse_hex(raw_type)?;
        let frame_type = u8::try_from(raw_type)
            .ok()
            .and_then(FrameType::from_u8)
            .ok_or_else(|| invalid(format!("unknown frame type 0x{:x}", raw_type)))?;

        let (raw_len, after_len) = split_field(after_type)?;
        let len = parse_hex(raw_len)? as usize;
        if after_len.len() < len {
            return Err(invalid(format!(
                "frame length {} runs past the end of input ({} bytes left)",
                len,
                after_len.len()
            )));
        }
        if !after_len.is_char_boundary(len) {
            return Err(invalid("frame length splits a UTF-8 sequence"));
        }
        let (body, remaining) = after_len.split_at(len);

        let frame = if frame_type == FrameType::Data {
            let (raw_message_type, text) = split_field(body)?;
            let raw_message_type = parse_hex(raw_message_type)?;
            let message_type = u8::try_from(raw_message_type)
                .ok()
                .and_then(MessageType::from_u8)
                .ok_or_else(|| {
                    invalid(format!("unknown message type 0x{:x}", raw_message_type))
                })?;
            Frame::data(message_type, text)
        } else {
            Frame::new(frame_type, MessageType::Text, body)
        };

        frames.push(frame);
        rest = remaining;
    }

    Ok(frames)
}

fn split_field(input: &str) -> Result<(&str, &str)> {
    let end = input
        .find(FRAME_DELIMITER)
        .ok_or_else(|| invalid("missing field delimiter"))?;
    let field = &input[..end];
    if field.is_empty() || field.len() > MAX_FIELD_DIGITS {
        return Err(invalid(format!("bad field width {}", field.len())));
    }
    Ok((field, &input[end + FRAME_DELIMITER.len_utf8()..]))
}

fn parse_hex(field: &str) -> Result<u32> {
    if !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid(format!("'{}' is not a hex number", field)));
    }
    u32::from_str_radix(field, 16).map_err(|e| invalid(e.to_string()))
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidFrame {
        reason: reason.into(),
    }
}
