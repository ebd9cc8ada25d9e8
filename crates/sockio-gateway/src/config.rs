//! Gateway configuration

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sockio_transport::TransportConfig;

use crate::error::{GatewayError, Result};

/// Default mount point of all transports.
pub const DEFAULT_PATH_PREFIX: &str = "/socket.io";

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Path under which transports are mounted.
    pub path_prefix: String,
    /// Transport timing and sizing.
    pub transport: TransportConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            transport: TransportConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads a `.toml` or `.json` configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: GatewayConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the transports cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.path_prefix.starts_with('/') {
            return Err(GatewayError::InvalidConfig {
                field: "path_prefix",
                reason: format!("must start with '/', got {:?}", self.path_prefix),
            });
        }
        if self.transport.buffer_size == 0 {
            return Err(GatewayError::InvalidConfig {
                field: "transport.buffer_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.transport.poll_timeout_ms >= self.transport.http_request_timeout_ms {
            return Err(GatewayError::InvalidConfig {
                field: "transport.poll_timeout_ms",
                reason: "must be shorter than http_request_timeout_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Prefix without a trailing slash, as axum nests it.
    pub fn normalized_prefix(&self) -> &str {
        let trimmed = self.path_prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }
}
