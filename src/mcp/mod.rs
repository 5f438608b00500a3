//! Client side of the Model Context Protocol
//!
//! The bridge speaks to remote servers through these layers:
//!
//! - `types`      -- JSON-RPC primitives and the MCP messages the bridge uses
//! - `transport`  -- `Transport` trait and the HTTP/SSE implementation
//! - `client`     -- JSON-RPC request/response matching over a transport
//! - `connection` -- `McpConnection` lifecycle and operations, plus the
//!   factory the session manager builds connections with

pub mod client;
pub mod connection;
pub mod transport;
pub mod types;
