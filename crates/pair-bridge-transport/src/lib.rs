//! Transport layer for the pair bridge.
//!
//! Provides:
//! - Wire protocol (newline-delimited JSON)
//! - `BridgeServer` - per-session broker on a Unix domain socket
//! - `BridgeClient` - one-connection-per-call client

pub mod client;
mod connection;
pub mod protocol;
pub mod server;

pub use client::{BridgeClient, ClientError};
pub use connection::ConnectionError;
pub use protocol::{BridgeCommand, BridgeResponse, ProtocolError, Reply};
pub use server::{BridgeServer, BrokerError, BrokerState};
