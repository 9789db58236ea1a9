//! Node-to-node and CLI-to-node RPC
//!
//! Architecture:
//! - `NodeServer`: serves one router over TCP, thread per connection
//! - `NodeClient`: blocking request/response client used by the CLI
//! - `TcpTransport`: the router's view of its peers, one connection per relay

mod client;
mod daemon;
pub mod protocol;

pub use client::{DEFAULT_CONNECT_TIMEOUT, NodeClient, TcpTransport};
pub use daemon::NodeServer;
pub use protocol::{PublicQuery, Request, Response};
