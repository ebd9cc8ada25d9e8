//! Transport timing and sizing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by all transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity in bytes of each polling session's outbound buffer.
    pub buffer_size: usize,
    /// Longest a producer waits on a full buffer; also the socket idle limit.
    pub max_idle_time_ms: u64,
    /// Request-level timeout of a suspended poll.
    pub poll_timeout_ms: u64,
    /// Longest a proxy lets an HTTP request live.
    pub http_request_timeout_ms: u64,
    /// Heartbeat interval of persistent polling sessions.
    pub heartbeat_delay_ms: u64,
    /// Heartbeat acknowledgement timeout of persistent polling sessions.
    pub heartbeat_timeout_ms: u64,
    /// Heartbeat acknowledgement timeout of websocket sessions.
    pub connection_timeout_ms: u64,
    /// Messages queued for a socket writer before producers have to wait.
    pub socket_queue_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            max_idle_time_ms: 300_000,
            poll_timeout_ms: 20_000,
            http_request_timeout_ms: 30_000,
            heartbeat_delay_ms: 15_000,
            heartbeat_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            socket_queue_len: 256,
        }
    }
}

impl TransportConfig {
    /// Producer wait on a full buffer.
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    /// Suspended poll timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// How long a single-shot polling session may go without an attached poll.
    pub fn between_polls_timeout(&self) -> Duration {
        let slack = self
            .http_request_timeout_ms
            .saturating_sub(self.poll_timeout_ms);
        Duration::from_millis(slack / 2)
    }

    /// Heartbeat interval of persistent polling sessions.
    pub fn heartbeat_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_delay_ms)
    }

    /// Heartbeat acknowledgement timeout of persistent polling sessions.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Websocket heartbeat: half the socket idle limit.
    pub fn websocket_heartbeat(&self) -> Duration {
        self.max_idle_time() / 2
    }

    /// Websocket heartbeat acknowledgement timeout.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Capacity of a socket writer queue; never zero.
    pub fn socket_queue_capacity(&self) -> usize {
        self.socket_queue_len.max(1)
    }
}
