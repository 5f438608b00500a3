//! Connection collaborator used by the session manager
//!
//! [`McpConnection`] is the narrow surface the manager needs from a remote
//! server: lifecycle, the list/call/read/get operations and the metadata
//! negotiated during `initialize`. [`ConnectionFactory`] builds one from a
//! [`ConnectionSpec`], which keeps the manager independent of the wire and
//! lets tests substitute recording fakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{BridgeError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::transport::http::HttpTransport;
use crate::mcp::transport::{Transport, TransportKind};
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, GetPromptParams, GetPromptResponse,
    Implementation, InitializeParams, InitializeResponse, ListPromptsResponse,
    ListResourceTemplatesResponse, ListResourcesResponse, ListToolsResponse, McpTool,
    PaginatedParams, Prompt, ReadResourceParams, ReadResourceResponse, Resource,
    ResourceTemplate, ServerCapabilities, LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_RESOURCES_TEMPLATES_LIST, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Everything needed to build a connection to one server.
///
/// `headers` already contains the auth headers for the server's strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    pub server_name: String,
    pub url: Url,
    pub transport: TransportKind,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

/// A live (or not yet opened) session with a remote server.
///
/// Protocol operations fail with [`BridgeError::Connection`] when the
/// connection is not open and with [`BridgeError::UpstreamProtocol`] when the
/// server answers with an error.
#[async_trait::async_trait]
pub trait McpConnection: Send + Sync + std::fmt::Debug {
    /// Opens the transport and performs the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Unauthorized`] on a 401, otherwise
    /// [`BridgeError::Connection`] or the handshake's protocol error.
    async fn connect(&self) -> Result<()>;

    /// Closes the session. Never fails.
    async fn close(&self);

    /// `false` after `close` or once the remote session is lost.
    fn is_open(&self) -> bool;

    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    async fn list_resources(&self) -> Result<Vec<Resource>>;

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>>;

    async fn list_prompts(&self) -> Result<Vec<Prompt>>;

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResponse>;

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResponse>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse>;

    /// Capabilities reported by the server, once connected.
    fn capabilities(&self) -> Option<ServerCapabilities>;

    /// Implementation info reported by the server, once connected.
    fn server_info(&self) -> Option<Implementation>;
}

/// Builds connections from specs.
pub trait ConnectionFactory: Send + Sync + std::fmt::Debug {
    fn create(&self, spec: ConnectionSpec) -> Arc<dyn McpConnection>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Builds [`HttpMcpConnection`]s sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConnectionFactory {
    http: reqwest::Client,
}

impl HttpConnectionFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self, spec: ConnectionSpec) -> Arc<dyn McpConnection> {
        Arc::new(HttpMcpConnection::new(self.http.clone(), spec))
    }
}

/// [`McpConnection`] over [`HttpTransport`] and [`JsonRpcClient`].
#[derive(Debug)]
pub struct HttpMcpConnection {
    spec: ConnectionSpec,
    transport: Arc<HttpTransport>,
    client: Arc<JsonRpcClient>,
    cancellation: CancellationToken,
    open: AtomicBool,
    initialized: std::sync::RwLock<Option<InitializeResponse>>,
}

impl HttpMcpConnection {
    /// Creates an unopened connection.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use std::time::Duration;
    /// use url::Url;
    /// use mcpbridge::mcp::connection::{ConnectionSpec, HttpMcpConnection, McpConnection};
    /// use mcpbridge::mcp::transport::TransportKind;
    ///
    /// let spec = ConnectionSpec {
    ///     server_name: "local".to_string(),
    ///     url: Url::parse("http://localhost:3001/mcp").unwrap(),
    ///     transport: TransportKind::StreamableHttp,
    ///     headers: HashMap::new(),
    ///     timeout: Duration::from_secs(30),
    /// };
    /// let connection = HttpMcpConnection::new(reqwest::Client::new(), spec);
    /// assert!(!connection.is_open());
    /// ```
    pub fn new(http: reqwest::Client, spec: ConnectionSpec) -> Self {
        let transport = Arc::new(HttpTransport::new(
            http,
            spec.transport,
            spec.url.clone(),
            spec.headers.clone(),
            spec.timeout,
        ));
        let client = Arc::new(JsonRpcClient::new(
            spec.server_name.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            spec.timeout,
        ));

        Self {
            spec,
            transport,
            client,
            cancellation: CancellationToken::new(),
            open: AtomicBool::new(false),
            initialized: std::sync::RwLock::new(None),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BridgeError::Connection(format!(
                "connection to '{}' is not open",
                self.spec.server_name
            ))
            .into())
        }
    }

    async fn handshake(&self) -> Result<InitializeResponse> {
        let response: InitializeResponse = self
            .client
            .request(
                METHOD_INITIALIZE,
                InitializeParams {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities: ClientCapabilities::default(),
                    client_info: Implementation {
                        name: env!("CARGO_PKG_NAME").to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        title: None,
                    },
                },
            )
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(BridgeError::UpstreamProtocol {
                code: None,
                message: format!(
                    "server selected unsupported protocol version {}",
                    response.protocol_version
                ),
            }
            .into());
        }

        if let Err(e) = self
            .client
            .notify(METHOD_INITIALIZED, serde_json::json!({}))
            .await
        {
            debug!(server = %self.spec.server_name, error = %e, "initialized notification failed");
        }

        Ok(response)
    }

    /// Follows `nextCursor` until the server stops returning one.
    async fn paginate<R, T>(
        &self,
        method: &str,
        split: fn(R) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>>
    where
        R: DeserializeOwned,
    {
        self.ensure_open()?;

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page: R = self
                .client
                .request(method, PaginatedParams { cursor })
                .await?;
            let (batch, next) = split(page);
            items.extend(batch);

            match next {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait::async_trait]
impl McpConnection for HttpMcpConnection {
    async fn connect(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            if self.transport.is_alive() {
                return Ok(());
            }
            return Err(BridgeError::Connection(format!(
                "session with '{}' was lost; open a new connection",
                self.spec.server_name
            ))
            .into());
        }

        self.transport.open().await?;
        self.client.start_read_loop(self.cancellation.clone());

        match self.handshake().await {
            Ok(response) => {
                info!(
                    server = %self.spec.server_name,
                    transport = %self.spec.transport,
                    remote = %response.server_info.name,
                    protocol = %response.protocol_version,
                    "Connected"
                );
                if let Ok(mut slot) = self.initialized.write() {
                    *slot = Some(response);
                }
                self.open.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.cancellation.cancel();
                self.transport.close().await;
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.cancellation.cancel();
        self.transport.close().await;
        debug!(server = %self.spec.server_name, "Connection closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.transport.is_alive()
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.paginate(METHOD_TOOLS_LIST, |r: ListToolsResponse| (r.tools, r.next_cursor))
            .await
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.paginate(METHOD_RESOURCES_LIST, |r: ListResourcesResponse| {
            (r.resources, r.next_cursor)
        })
        .await
    }

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        self.paginate(
            METHOD_RESOURCES_TEMPLATES_LIST,
            |r: ListResourceTemplatesResponse| (r.resource_templates, r.next_cursor),
        )
        .await
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.paginate(METHOD_PROMPTS_LIST, |r: ListPromptsResponse| {
            (r.prompts, r.next_cursor)
        })
        .await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResponse> {
        self.ensure_open()?;
        self.client
            .request(
                METHOD_TOOLS_CALL,
                CallToolParams {
                    name: name.to_string(),
                    arguments,
                },
            )
            .await
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResponse> {
        self.ensure_open()?;
        self.client
            .request(
                METHOD_RESOURCES_READ,
                ReadResourceParams {
                    uri: uri.to_string(),
                },
            )
            .await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        self.ensure_open()?;
        self.client
            .request(
                METHOD_PROMPTS_GET,
                GetPromptParams {
                    name: name.to_string(),
                    arguments,
                },
            )
            .await
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        self.initialized
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|r| r.capabilities.clone()))
    }

    fn server_info(&self) -> Option<Implementation> {
        self.initialized
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|r| r.server_info.clone()))
    }
}
