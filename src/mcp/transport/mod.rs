//! Transport abstraction for remote MCP servers
//!
//! [`Transport`] moves serialized JSON-RPC messages between the bridge and
//! one remote server. The only production implementation is
//! [`http::HttpTransport`], which covers every [`TransportKind`]; the kinds
//! differ only in how the session is opened and which headers are sent.
//!
//! Callers `send` a complete JSON object and consume inbound messages from
//! the stream returned by `receive`. Framing and session bookkeeping belong
//! to the implementation.

use std::fmt;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod http;

/// Wire mechanism used to reach a remote server.
///
/// # Examples
///
/// ```
/// use mcpbridge::mcp::transport::TransportKind;
///
/// let kind: TransportKind = serde_json::from_str(r#""streamable-http""#).unwrap();
/// assert_eq!(kind, TransportKind::StreamableHttp);
/// assert_eq!(TransportKind::default(), TransportKind::Sse);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Long-lived event stream opened with `GET`, messages posted back.
    #[default]
    Sse,
    /// Every message is a `POST`; replies arrive as JSON or an event stream.
    StreamableHttp,
    /// Older stream-then-post variant, handled like [`TransportKind::Sse`].
    HttpSse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::HttpSse => "http-sse",
        }
    }

    /// Returns `true` when the session starts with a `GET` event stream.
    pub fn opens_event_stream(&self) -> bool {
        matches!(self, TransportKind::Sse | TransportKind::HttpSse)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bidirectional message channel to one remote server.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Establishes the session. For streamable HTTP this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BridgeError::Unauthorized`] on a 401 and
    /// [`crate::error::BridgeError::Connection`] for any other failure.
    async fn open(&self) -> Result<()>;

    /// Sends one serialized JSON-RPC message.
    ///
    /// # Errors
    ///
    /// Same classification as [`Transport::open`].
    async fn send(&self, message: String) -> Result<()>;

    /// Stream of inbound JSON-RPC message strings, ending when the
    /// transport closes.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// `false` once the session is known to be lost; the transport must
    /// then be replaced rather than reused.
    fn is_alive(&self) -> bool;

    /// Terminates the session. Best effort, never fails.
    async fn close(&self);
}
