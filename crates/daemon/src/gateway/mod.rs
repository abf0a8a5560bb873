//! Session gateway.
//!
//! Remote viewers connect over WebSocket and exchange tagged messages with
//! the daemon: they attach to a session to receive its output, send input,
//! resize it, and detach. The transport lives in [`server`]; per-connection
//! message handling lives in [`connection`].

pub mod connection;
pub mod server;

pub use connection::GatewayConnection;
pub use server::GatewayServer;
