//! mcpbridge - authenticated, multi-tenant bridge to remote MCP servers
//!
//! This library holds everything the `mcpbridge` binary runs: OAuth 2.1
//! client logic, the MCP client stack, the session manager that ties them
//! together, and the HTTP API in front of it.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: OAuth discovery, PKCE, dynamic registration, token lifecycle
//! - `mcp`: JSON-RPC types, HTTP/SSE transport, client and connections
//! - `registry`: Server configurations and authentication strategies
//! - `manager`: Session manager with lazy connect and 401 recovery
//! - `server`: axum routes, including the OAuth callback
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcpbridge::{BridgeConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let manager = Arc::new(SessionManager::from_config(&config).await?);
//!     mcpbridge::server::serve(manager, &config.server.host, config.server.port).await
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod manager;
pub mod mcp;
pub mod registry;
pub mod server;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use manager::SessionManager;
