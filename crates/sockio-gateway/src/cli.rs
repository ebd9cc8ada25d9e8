//! Command-line interface of the gateway binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::GatewayConfig;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "sockio-gateway")]
#[command(about = "Session transport gateway (long polling and websocket)", long_about = None)]
pub struct Cli {
    /// Configuration file (`.toml` or `.json`).
    #[arg(short, long, env = "SOCKIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, overriding the configuration file.
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Path prefix, overriding the configuration file.
    #[arg(short, long)]
    pub prefix: Option<String>,
}

impl Cli {
    /// Loads the configuration file, if any, and applies the overrides.
    pub fn load_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) if path.exists() => GatewayConfig::from_file(path)?,
            Some(path) => {
                tracing::warn!("Config file not found, using defaults: {}", path.display());
                GatewayConfig::default()
            }
            None => GatewayConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(prefix) = &self.prefix {
            config.path_prefix = prefix.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
