#![warn(missing_docs)]

//! sockio gateway subsystem: HTTP long-polling and websocket front-end, echo application

pub mod cli;
pub mod config;
pub mod echo;
pub mod error;
pub mod server;
pub mod ws;

pub use config::GatewayConfig;
pub use echo::{EchoFactory, EchoInbound};
pub use error::GatewayError;
pub use server::Gateway;
