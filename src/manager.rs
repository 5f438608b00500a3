//! Session manager
//!
//! [`SessionManager`] owns the server registry, the OAuth engine and one
//! connection slot per server name. Every protocol operation goes through
//! [`SessionManager::get_connection`], which connects lazily:
//!
//! 1. `oauth2-client-credentials` without a usable token performs the grant.
//! 2. `oauth2` without a usable token initiates the authorization-code flow
//!    and fails with [`BridgeError::AuthorizationRequired`].
//! 3. A server configured without auth is probed; an OAuth challenge
//!    upgrades it to `oauth2` and continues as in step 2.
//! 4. Auth headers are built for the strategy and the connection is opened.
//!
//! A 401 on an OAuth server triggers one refresh (or one fresh
//! client-credentials grant) and one reconnect. The failed operation is not
//! replayed; the caller receives [`BridgeError::Reconnected`] and re-issues it.
//!
//! Each slot is a `tokio::sync::Mutex`, so concurrent callers for the same
//! server wait for the first caller's connect attempt and then share its
//! connection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::engine::{EngineSettings, OAuthEngine, OAuthStatus};
use crate::config::BridgeConfig;
use crate::error::{bridge_error, is_unauthorized, AuthorizationRequired, BridgeError, Result};
use crate::mcp::connection::{ConnectionFactory, ConnectionSpec, HttpConnectionFactory, McpConnection};
use crate::mcp::transport::TransportKind;
use crate::mcp::types::{
    CallToolResponse, GetPromptResponse, Implementation, McpTool, Prompt, ReadResourceResponse,
    Resource, ResourceTemplate, ServerCapabilities,
};
use crate::registry::{
    auth_headers, AuthStrategy, AuthType, OAuthSettings, ServerConfig, ServerConfigInput,
    ServerConfigPatch, ServerRegistry,
};

/// Upper bound on closing one connection during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Slot = Arc<Mutex<Option<Arc<dyn McpConnection>>>>;

/// Manager behavior switches.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Probe servers configured without auth for an OAuth challenge.
    pub probe_unauthenticated: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            probe_unauthenticated: true,
        }
    }
}

/// Caller overrides for [`SessionManager::initiate_oauth_flow`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOptions {
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/// Status of one server, safe to expose to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ServerCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthStatus>,
}

impl ServerStatus {
    fn not_registered(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registered: false,
            url: None,
            transport: None,
            auth_type: None,
            connected: false,
            capabilities: None,
            server_info: None,
            oauth: None,
        }
    }
}

/// Owner of every server configuration, connection and OAuth state.
#[derive(Debug)]
pub struct SessionManager {
    registry: ServerRegistry,
    engine: OAuthEngine,
    factory: Arc<dyn ConnectionFactory>,
    connections: RwLock<HashMap<String, Slot>>,
    settings: ManagerSettings,
}

impl SessionManager {
    /// Creates an empty manager.
    ///
    /// # Arguments
    ///
    /// * `engine` - OAuth engine shared by every server
    /// * `factory` - Builds connections
    /// * `settings` - Behavior switches
    pub fn new(
        engine: OAuthEngine,
        factory: Arc<dyn ConnectionFactory>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry: ServerRegistry::new(),
            engine,
            factory,
            connections: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Builds the production manager and registers the configured servers.
    ///
    /// # Errors
    ///
    /// Fails when an HTTP client cannot be built or a static server
    /// configuration is invalid.
    pub async fn from_config(config: &BridgeConfig) -> Result<Self> {
        let oauth_timeout = Duration::from_secs(config.oauth.http_timeout_seconds);
        let oauth_http = reqwest::Client::builder()
            .timeout(oauth_timeout)
            .build()
            .map_err(BridgeError::Http)?;
        // No global timeout: event streams stay open. Requests carry their own.
        let transport_http = reqwest::Client::builder()
            .connect_timeout(oauth_timeout)
            .build()
            .map_err(BridgeError::Http)?;

        let engine = OAuthEngine::from_settings(
            oauth_http,
            config.oauth.metadata_ttl(),
            EngineSettings {
                client_name: config.oauth.client_name.clone(),
                callback: config.callback_settings(),
            },
        );
        let manager = Self::new(
            engine,
            Arc::new(HttpConnectionFactory::new(transport_http)),
            ManagerSettings {
                probe_unauthenticated: config.oauth.probe_unauthenticated,
            },
        );

        for server in config.server_configs()? {
            info!(server = %server.name, url = %server.url, auth = %server.auth.auth_type(), "Registered server");
            manager.registry.register(server).await;
        }

        Ok(manager)
    }

    pub fn engine(&self) -> &OAuthEngine {
        &self.engine
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Registry operations
    // -----------------------------------------------------------------------

    /// Registers (or replaces) a server. A replaced server's connection is
    /// closed first, and its tokens are revoked when the URL or auth type
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] for invalid input.
    pub async fn register_server(&self, name: &str, input: ServerConfigInput) -> Result<ServerConfig> {
        let config = input.into_config(name)?;
        self.drop_connection(name).await;
        if let Some(previous) = self.registry.register(config.clone()).await {
            self.forget_stale_auth(&previous, &config).await;
            info!(server = name, "Replaced server configuration");
        } else {
            info!(server = name, url = %config.url, "Registered server");
        }
        Ok(config)
    }

    /// Applies a partial update after closing the live connection.
    ///
    /// Tokens are revoked when the URL or auth type changes; cached
    /// metadata is dropped when the URL or metadata URL changes.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ServerNotFound`] or the merged configuration's
    /// validation error.
    pub async fn update_server(&self, name: &str, patch: ServerConfigPatch) -> Result<ServerConfig> {
        let previous = self.registry.require(name).await?;
        self.drop_connection(name).await;
        let config = self.registry.update(name, patch).await?;
        self.forget_stale_auth(&previous, &config).await;
        info!(server = name, "Updated server configuration");
        Ok(config)
    }

    /// Disconnects, revokes tokens and forgets the server.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ServerNotFound`] for an unknown name.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        self.registry.require(name).await?;
        self.drop_connection(name).await;
        self.engine.revoke(name).await;
        self.registry.remove(name).await;
        self.connections.write().await.remove(name);
        info!(server = name, "Removed server");
        Ok(())
    }

    /// Status of every registered server, sorted by name.
    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for config in self.registry.list().await {
            statuses.push(self.status_of(&config).await);
        }
        statuses
    }

    /// Status of one server; unknown names yield a not-registered status.
    pub async fn get_server_status(&self, name: &str) -> ServerStatus {
        match self.registry.get(name).await {
            Some(config) => self.status_of(&config).await,
            None => ServerStatus::not_registered(name),
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Returns an open connection, connecting if needed.
    ///
    /// A 401 on an OAuth server is recovered once; on success the fresh
    /// connection is returned.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AuthorizationRequired`] when the user must authorize,
    /// [`BridgeError::ServerNotFound`], or the classified connect failure.
    pub async fn get_connection(&self, name: &str) -> Result<Arc<dyn McpConnection>> {
        match self.ensure_connected(name, true).await {
            Err(e) if is_unauthorized(&e) => {
                self.recover(name, e).await?;
                self.ensure_connected(name, false).await
            }
            other => other,
        }
    }

    /// Closes the server's connection, if any.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ServerNotFound`] for an unknown name.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.registry.require(name).await?;
        self.drop_connection(name).await;
        Ok(())
    }

    /// Closes every connection. A connection that does not close within a
    /// few seconds is abandoned with a warning.
    pub async fn disconnect_all(&self) {
        let slots: Vec<(String, Slot)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();

        for (name, slot) in slots {
            let connection = match tokio::time::timeout(CLOSE_TIMEOUT, slot.lock()).await {
                Ok(mut guard) => guard.take(),
                Err(_) => {
                    warn!(server = %name, "Connection busy; skipping close");
                    continue;
                }
            };
            if let Some(connection) = connection {
                if tokio::time::timeout(CLOSE_TIMEOUT, connection.close())
                    .await
                    .is_err()
                {
                    warn!(server = %name, "Timed out closing connection");
                } else {
                    debug!(server = %name, "Connection closed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Protocol operations
    // -----------------------------------------------------------------------

    pub async fn list_tools(&self, name: &str) -> Result<Vec<McpTool>> {
        self.run(name, |c| async move { c.list_tools().await }).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResponse> {
        self.run(name, |c| async move { c.call_tool(tool, arguments).await })
            .await
    }

    pub async fn list_resources(&self, name: &str) -> Result<Vec<Resource>> {
        self.run(name, |c| async move { c.list_resources().await })
            .await
    }

    pub async fn read_resource(&self, name: &str, uri: &str) -> Result<ReadResourceResponse> {
        self.run(name, |c| async move { c.read_resource(uri).await })
            .await
    }

    pub async fn list_resource_templates(&self, name: &str) -> Result<Vec<ResourceTemplate>> {
        self.run(name, |c| async move { c.list_resource_templates().await })
            .await
    }

    pub async fn list_prompts(&self, name: &str) -> Result<Vec<Prompt>> {
        self.run(name, |c| async move { c.list_prompts().await })
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        prompt: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        self.run(name, |c| async move { c.get_prompt(prompt, arguments).await })
            .await
    }

    // -----------------------------------------------------------------------
    // OAuth operations
    // -----------------------------------------------------------------------

    /// Starts an authorization-code flow for `name`.
    ///
    /// A server configured without auth is switched to `oauth2`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] for API key, bearer and client-credentials
    /// servers, or the engine's initiation error.
    pub async fn initiate_oauth_flow(
        &self,
        name: &str,
        options: &FlowOptions,
    ) -> Result<AuthorizationRequired> {
        let config = self.registry.require(name).await?;

        let settings = match &config.auth {
            AuthStrategy::OAuth2(settings) => settings.clone(),
            AuthStrategy::None => {
                let settings = OAuthSettings::default();
                self.registry
                    .set_auth(name, AuthStrategy::OAuth2(settings.clone()))
                    .await;
                settings
            }
            AuthStrategy::OAuth2ClientCredentials(_) => {
                return Err(BridgeError::Config(format!(
                    "server '{name}' uses client credentials; no user authorization is needed"
                ))
                .into())
            }
            AuthStrategy::ApiKey { .. } | AuthStrategy::BearerToken { .. } => {
                return Err(BridgeError::Config(format!(
                    "server '{name}' is not configured for OAuth"
                ))
                .into())
            }
        };

        let mut initiate = settings.initiate_options();
        if let Some(callback_url) = &options.callback_url {
            initiate.callback_url = Some(callback_url.clone());
        }
        if let Some(scopes) = &options.scopes {
            initiate.scopes = scopes.clone();
        }

        self.engine.initiate(name, &config.url, &initiate).await
    }

    /// Completes a flow from the callback parameters.
    ///
    /// The server's existing connection is closed so the next call connects
    /// with the new token.
    ///
    /// # Returns
    ///
    /// The name of the server that is now authorized.
    pub async fn complete_oauth_flow(&self, code: &str, state: &str) -> Result<String> {
        let name = self.engine.complete(code, state).await?;
        self.drop_connection(&name).await;
        Ok(name)
    }

    /// Runs the client-credentials grant for a client-credentials server.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] when the server uses another strategy or
    /// lacks a secret, or [`BridgeError::OAuth`] when the grant fails.
    pub async fn perform_client_credentials_grant(&self, name: &str) -> Result<OAuthStatus> {
        let config = self.registry.require(name).await?;
        let AuthStrategy::OAuth2ClientCredentials(settings) = &config.auth else {
            return Err(BridgeError::Config(format!(
                "server '{name}' is not configured for oauth2-client-credentials"
            ))
            .into());
        };

        self.grant_client_credentials(&config, settings).await?;
        self.drop_connection(name).await;
        Ok(self.engine.status(name, Some(&config.url)).await)
    }

    /// Returns `true` when `name` uses `oauth2` and holds no usable tokens.
    pub async fn requires_oauth_authorization(&self, name: &str) -> Result<bool> {
        let config = self.registry.require(name).await?;
        Ok(matches!(config.auth, AuthStrategy::OAuth2(_))
            && !self.engine.has_valid_tokens(name).await)
    }

    pub async fn get_oauth_status(&self, name: &str) -> Result<OAuthStatus> {
        let config = self.registry.require(name).await?;
        Ok(self.engine.status(name, Some(&config.url)).await)
    }

    /// Disconnects and revokes the server's tokens.
    pub async fn revoke_oauth_tokens(&self, name: &str) -> Result<()> {
        self.registry.require(name).await?;
        self.drop_connection(name).await;
        self.engine.revoke(name).await;
        info!(server = name, "OAuth tokens revoked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn slot(&self, name: &str) -> Slot {
        if let Some(slot) = self.connections.read().await.get(name) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.connections
                .write()
                .await
                .entry(name.to_string())
                .or_default(),
        )
    }

    async fn drop_connection(&self, name: &str) {
        let slot = match self.connections.read().await.get(name) {
            Some(slot) => Arc::clone(slot),
            None => return,
        };
        let connection = slot.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
            debug!(server = name, "Dropped connection");
        }
    }

    async fn status_of(&self, config: &ServerConfig) -> ServerStatus {
        // A slot held by an in-flight connect reports as not connected.
        let connection = match self.connections.read().await.get(&config.name) {
            Some(slot) => slot.try_lock().ok().and_then(|guard| guard.clone()),
            None => None,
        };
        let connected = connection.as_ref().is_some_and(|c| c.is_open());

        let oauth = if config.auth.is_oauth() {
            Some(self.engine.status(&config.name, Some(&config.url)).await)
        } else {
            None
        };

        ServerStatus {
            name: config.name.clone(),
            registered: true,
            url: Some(config.url.to_string()),
            transport: Some(config.transport),
            auth_type: Some(config.auth.auth_type()),
            connected,
            capabilities: connection
                .as_ref()
                .filter(|_| connected)
                .and_then(|c| c.capabilities()),
            server_info: connection
                .as_ref()
                .filter(|_| connected)
                .and_then(|c| c.server_info()),
            oauth,
        }
    }

    /// Runs `op` on the server's connection, recovering once from a 401.
    async fn run<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn McpConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = match self.ensure_connected(name, true).await {
            Ok(connection) => op(connection).await,
            Err(e) => Err(e),
        };

        match outcome {
            Err(e) if is_unauthorized(&e) => {
                self.recover(name, e).await?;
                Err(BridgeError::Reconnected(name.to_string()).into())
            }
            other => other,
        }
    }

    async fn ensure_connected(&self, name: &str, retry: bool) -> Result<Arc<dyn McpConnection>> {
        let config = self.registry.require(name).await?;
        let slot = self.slot(name).await;
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_ref() {
            if existing.is_open() {
                return Ok(Arc::clone(existing));
            }
            debug!(server = name, "Replacing stale connection");
            existing.close().await;
            *guard = None;
        }

        let retries = if retry { config.retries } else { 0 };
        let connection = self.connect_with_retries(&config, retries).await?;
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn connect_with_retries(
        &self,
        config: &ServerConfig,
        retries: u32,
    ) -> Result<Arc<dyn McpConnection>> {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_once(config).await {
                Ok(connection) => return Ok(connection),
                Err(e) if attempt < retries && is_transient(&e) => {
                    let delay = config
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        server = %config.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(&self, config: &ServerConfig) -> Result<Arc<dyn McpConnection>> {
        let (strategy, token) = self.credentials_for(config).await?;

        let mut headers = config.headers.clone();
        headers.extend(auth_headers(&strategy, token.as_deref())?);

        let connection = self.factory.create(ConnectionSpec {
            server_name: config.name.clone(),
            url: config.url.clone(),
            transport: config.transport,
            headers,
            timeout: config.timeout,
        });

        match connection.connect().await {
            Ok(()) => {
                info!(server = %config.name, transport = %config.transport, auth = %strategy.auth_type(), "Server connected");
                Ok(connection)
            }
            Err(e)
                if is_unauthorized(&e)
                    && strategy == AuthStrategy::None
                    && self.settings.probe_unauthenticated =>
            {
                info!(server = %config.name, "Server rejected unauthenticated connect; switching to OAuth");
                Err(self.upgrade_to_oauth(config).await)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves the effective strategy and, for OAuth, a usable token.
    async fn credentials_for(&self, config: &ServerConfig) -> Result<(AuthStrategy, Option<String>)> {
        match &config.auth {
            AuthStrategy::None => {
                if self.settings.probe_unauthenticated
                    && self.engine.discovery().probe(&config.url).await.is_some()
                {
                    info!(server = %config.name, "Server answered with an auth challenge; switching to OAuth");
                    return Err(self.upgrade_to_oauth(config).await);
                }
                Ok((AuthStrategy::None, None))
            }
            AuthStrategy::ApiKey { .. } | AuthStrategy::BearerToken { .. } => {
                Ok((config.auth.clone(), None))
            }
            AuthStrategy::OAuth2(settings) => {
                if let Some(token) = self.token_for(config).await {
                    return Ok((config.auth.clone(), Some(token)));
                }
                Err(self.authorization_required(config, settings).await)
            }
            AuthStrategy::OAuth2ClientCredentials(settings) => {
                if let Some(token) = self.token_for(config).await {
                    return Ok((config.auth.clone(), Some(token)));
                }
                self.grant_client_credentials(config, settings).await?;
                let token = self.engine.access_token(&config.name).await.ok_or_else(|| {
                    BridgeError::OAuth("client credentials grant issued no usable token".to_string())
                })?;
                Ok((config.auth.clone(), Some(token)))
            }
        }
    }

    /// Access token for `config`, ignoring (and discarding) tokens issued
    /// for another URL.
    async fn token_for(&self, config: &ServerConfig) -> Option<String> {
        let record = self.engine.store().tokens(&config.name).await?;
        if record.server_url != config.url {
            warn!(
                server = %config.name,
                issued_for = %record.server_url,
                url = %config.url,
                "Discarding tokens issued for a different URL"
            );
            self.engine.store().remove_tokens(&config.name).await;
            return None;
        }
        self.engine.access_token(&config.name).await
    }

    /// Drops credentials and metadata that no longer match `current`.
    async fn forget_stale_auth(&self, previous: &ServerConfig, current: &ServerConfig) {
        let url_changed = previous.url != current.url;
        if url_changed || previous.auth.auth_type() != current.auth.auth_type() {
            self.engine.revoke(&current.name).await;
            debug!(server = %current.name, "Revoked tokens of the previous configuration");
        }

        let metadata_url = |c: &ServerConfig| {
            c.auth
                .oauth_settings()
                .and_then(|s| s.metadata_url.clone())
        };
        if url_changed || metadata_url(previous) != metadata_url(current) {
            let store = self.engine.store();
            store.invalidate_metadata(&previous.url).await;
            store.invalidate_metadata(&current.url).await;
        }
    }

    /// Switches `config` to `oauth2` and starts a flow. Always an error.
    async fn upgrade_to_oauth(&self, config: &ServerConfig) -> anyhow::Error {
        let settings = OAuthSettings::default();
        self.registry
            .set_auth(&config.name, AuthStrategy::OAuth2(settings.clone()))
            .await;
        self.authorization_required(config, &settings).await
    }

    /// Starts a flow and wraps its result in
    /// [`BridgeError::AuthorizationRequired`].
    async fn authorization_required(
        &self,
        config: &ServerConfig,
        settings: &OAuthSettings,
    ) -> anyhow::Error {
        match self
            .engine
            .initiate(&config.name, &config.url, &settings.initiate_options())
            .await
        {
            Ok(required) => {
                info!(server = %config.name, "Authorization required");
                BridgeError::AuthorizationRequired(required).into()
            }
            Err(e) => e,
        }
    }

    async fn grant_client_credentials(
        &self,
        config: &ServerConfig,
        settings: &OAuthSettings,
    ) -> Result<()> {
        let (Some(client_id), Some(client_secret)) =
            (settings.client_id.as_deref(), settings.client_secret.as_deref())
        else {
            return Err(BridgeError::Config(format!(
                "server '{}' needs oauth.clientId and oauth.clientSecret for client credentials",
                config.name
            ))
            .into());
        };

        self.engine
            .client_credentials_grant(
                &config.name,
                &config.url,
                client_id,
                client_secret,
                &settings.scopes,
                settings.metadata_url.as_deref(),
            )
            .await
    }

    /// One refresh (or grant) and one reconnect after a 401.
    ///
    /// Returns `Ok` when connectivity is restored. Non-OAuth servers get the
    /// original error back.
    async fn recover(&self, name: &str, original: anyhow::Error) -> Result<()> {
        let config = self.registry.require(name).await?;

        match &config.auth {
            AuthStrategy::OAuth2(settings) => {
                warn!(server = name, "Server rejected the access token; refreshing");
                self.drop_connection(name).await;
                if let Err(e) = self.engine.refresh(name).await {
                    debug!(server = name, error = %e, "Refresh impossible; starting a new authorization");
                    self.engine.store().remove_tokens(name).await;
                    return Err(self.authorization_required(&config, settings).await);
                }
            }
            AuthStrategy::OAuth2ClientCredentials(_) => {
                warn!(server = name, "Server rejected the access token; requesting a new one");
                self.drop_connection(name).await;
                // Without a stored token the reconnect performs a fresh grant.
                self.engine.store().remove_tokens(name).await;
            }
            AuthStrategy::None | AuthStrategy::ApiKey { .. } | AuthStrategy::BearerToken { .. } => {
                return Err(original);
            }
        }

        self.ensure_connected(name, false).await?;
        info!(server = name, "Connection re-established after authorization failure");
        Ok(())
    }
}

/// Connection failures worth another attempt.
fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        bridge_error(err),
        Some(BridgeError::Connection(_) | BridgeError::Timeout { .. } | BridgeError::Http(_))
    )
}
