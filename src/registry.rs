//! Server registry
//!
//! Holds the configuration of every remote server the bridge can reach,
//! keyed by logical name. Configurations arrive as [`ServerConfigInput`]
//! (the camelCase JSON/YAML shape accepted from callers and config files)
//! and are validated into [`ServerConfig`], whose [`AuthStrategy`] carries
//! exactly the material its variant needs.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use url::Url;

use crate::auth::engine::InitiateOptions;
use crate::error::{BridgeError, Result};
use crate::mcp::transport::TransportKind;

/// Header carrying the key for [`AuthStrategy::ApiKey`] unless overridden.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

const MAX_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Auth strategy
// ---------------------------------------------------------------------------

/// OAuth material for the two OAuth strategies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Overrides merged into the dynamic registration request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl OAuthSettings {
    /// Options for starting an authorization-code flow with these settings.
    pub fn initiate_options(&self) -> InitiateOptions {
        InitiateOptions {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scopes: self.scopes.clone(),
            metadata_url: self.metadata_url.clone(),
            callback_url: self.callback_url.clone(),
            client_metadata: self.client_metadata.clone(),
        }
    }
}

/// Enumerated `authType` values of the input shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "api-key")]
    ApiKey,
    #[serde(rename = "bearer-token")]
    BearerToken,
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "oauth2-client-credentials")]
    OAuth2ClientCredentials,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::ApiKey => "api-key",
            AuthType::BearerToken => "bearer-token",
            AuthType::OAuth2 => "oauth2",
            AuthType::OAuth2ClientCredentials => "oauth2-client-credentials",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the bridge authenticates to one server.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthStrategy {
    None,
    ApiKey { key: String, header: String },
    BearerToken { token: String },
    OAuth2(OAuthSettings),
    OAuth2ClientCredentials(OAuthSettings),
}

impl AuthStrategy {
    pub fn auth_type(&self) -> AuthType {
        match self {
            AuthStrategy::None => AuthType::None,
            AuthStrategy::ApiKey { .. } => AuthType::ApiKey,
            AuthStrategy::BearerToken { .. } => AuthType::BearerToken,
            AuthStrategy::OAuth2(_) => AuthType::OAuth2,
            AuthStrategy::OAuth2ClientCredentials(_) => AuthType::OAuth2ClientCredentials,
        }
    }

    /// Returns `true` for the two strategies backed by the OAuth engine.
    pub fn is_oauth(&self) -> bool {
        self.oauth_settings().is_some()
    }

    pub fn oauth_settings(&self) -> Option<&OAuthSettings> {
        match self {
            AuthStrategy::OAuth2(settings) | AuthStrategy::OAuth2ClientCredentials(settings) => {
                Some(settings)
            }
            AuthStrategy::None | AuthStrategy::ApiKey { .. } | AuthStrategy::BearerToken { .. } => {
                None
            }
        }
    }
}

/// Builds the authentication headers for a strategy.
///
/// `token` is the current OAuth access token and is only consulted by the
/// OAuth strategies.
///
/// # Errors
///
/// Returns [`BridgeError::OAuth`] when an OAuth strategy has no token.
///
/// # Examples
///
/// ```
/// use mcpbridge::registry::{auth_headers, AuthStrategy};
///
/// let headers = auth_headers(&AuthStrategy::BearerToken { token: "t0k".into() }, None).unwrap();
/// assert_eq!(headers, vec![("Authorization".to_string(), "Bearer t0k".to_string())]);
/// assert!(auth_headers(&AuthStrategy::None, None).unwrap().is_empty());
/// ```
pub fn auth_headers(strategy: &AuthStrategy, token: Option<&str>) -> Result<Vec<(String, String)>> {
    match strategy {
        AuthStrategy::None => Ok(Vec::new()),
        AuthStrategy::ApiKey { key, header } => Ok(vec![(header.clone(), key.clone())]),
        AuthStrategy::BearerToken { token } => Ok(vec![bearer(token)]),
        AuthStrategy::OAuth2(_) | AuthStrategy::OAuth2ClientCredentials(_) => match token {
            Some(t) => Ok(vec![bearer(t)]),
            None => Err(BridgeError::OAuth("no access token available".to_string()).into()),
        },
    }
}

fn bearer(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {token}"))
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// Validated configuration of one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub url: Url,
    pub transport: TransportKind,
    pub auth: AuthStrategy,
    /// Extra headers sent on every request.
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    /// Extra connect attempts after a transient connection failure.
    pub retries: u32,
    /// Base delay, doubled on each retry.
    pub retry_backoff: Duration,
}

impl ServerConfig {
    /// Converts back into the input shape, used as the base of a patch.
    pub fn to_input(&self) -> ServerConfigInput {
        let mut input = ServerConfigInput {
            url: self.url.to_string(),
            transport: Some(self.transport),
            auth_type: Some(self.auth.auth_type()),
            headers: self.headers.clone(),
            timeout: Some(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)),
            retries: Some(self.retries),
            retry_backoff_ms: Some(
                u64::try_from(self.retry_backoff.as_millis()).unwrap_or(u64::MAX),
            ),
            ..ServerConfigInput::default()
        };

        match &self.auth {
            AuthStrategy::None => {}
            AuthStrategy::ApiKey { key, header } => {
                input.api_key = Some(key.clone());
                input.api_key_header = Some(header.clone());
            }
            AuthStrategy::BearerToken { token } => input.bearer_token = Some(token.clone()),
            AuthStrategy::OAuth2(settings) | AuthStrategy::OAuth2ClientCredentials(settings) => {
                input.oauth = Some(settings.clone())
            }
        }

        input
    }
}

/// Server configuration as accepted from callers and config files.
///
/// # Examples
///
/// ```
/// use mcpbridge::registry::{AuthType, ServerConfigInput};
///
/// let input: ServerConfigInput = serde_json::from_str(
///     r#"{"url": "https://mcp.example.com/sse", "authType": "bearer-token", "bearerToken": "abc"}"#,
/// ).unwrap();
/// let config = input.into_config("example").unwrap();
/// assert_eq!(config.auth.auth_type(), AuthType::BearerToken);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigInput {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

impl ServerConfigInput {
    /// Validates the input and builds a [`ServerConfig`] named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] for a bad name, a URL that is not
    /// `http`/`https`, missing strategy material or a zero timeout.
    pub fn into_config(self, name: &str) -> Result<ServerConfig> {
        validate_name(name)?;

        let url = Url::parse(self.url.trim())
            .map_err(|e| BridgeError::Validation(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BridgeError::Validation(format!(
                "url must use http or https, got '{}'",
                url.scheme()
            ))
            .into());
        }

        let auth = match self.auth_type.unwrap_or_default() {
            AuthType::None => AuthStrategy::None,
            AuthType::ApiKey => AuthStrategy::ApiKey {
                key: required(self.api_key, "apiKey", AuthType::ApiKey)?,
                header: self
                    .api_key_header
                    .filter(|h| !h.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
            },
            AuthType::BearerToken => AuthStrategy::BearerToken {
                token: required(self.bearer_token, "bearerToken", AuthType::BearerToken)?,
            },
            AuthType::OAuth2 => AuthStrategy::OAuth2(self.oauth.unwrap_or_default()),
            AuthType::OAuth2ClientCredentials => {
                let settings = self.oauth.unwrap_or_default();
                if settings.client_id.as_deref().map_or(true, str::is_empty) {
                    return Err(BridgeError::Validation(
                        "oauth2-client-credentials requires oauth.clientId".to_string(),
                    )
                    .into());
                }
                if settings.client_secret.as_deref().map_or(true, str::is_empty) {
                    return Err(BridgeError::Validation(
                        "oauth2-client-credentials requires oauth.clientSecret".to_string(),
                    )
                    .into());
                }
                AuthStrategy::OAuth2ClientCredentials(settings)
            }
        };

        let timeout_ms = self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(
                BridgeError::Validation("timeout must be greater than 0".to_string()).into(),
            );
        }

        Ok(ServerConfig {
            name: name.to_string(),
            url,
            transport: self.transport.unwrap_or_default(),
            auth,
            headers: self.headers,
            timeout: Duration::from_millis(timeout_ms),
            retries: self.retries.unwrap_or(DEFAULT_RETRIES),
            retry_backoff: Duration::from_millis(
                self.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
        })
    }
}

fn required(value: Option<String>, field: &str, auth_type: AuthType) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BridgeError::Validation(format!("{auth_type} requires {field}")).into()),
    }
}

/// Checks that a server name is usable as a path segment.
///
/// # Errors
///
/// Returns [`BridgeError::Validation`] for empty, overlong or
/// non-`[A-Za-z0-9._-]` names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BridgeError::Validation("server name cannot be empty".to_string()).into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(BridgeError::Validation(format!(
            "server name must be at most {MAX_NAME_LEN} characters"
        ))
        .into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(BridgeError::Validation(format!(
            "server name '{name}' may only contain letters, digits, '-', '_' and '.'"
        ))
        .into());
    }
    Ok(())
}

/// Partial update; present fields replace the current values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigPatch {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub auth_type: Option<AuthType>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub oauth: Option<OAuthSettings>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
}

impl ServerConfigPatch {
    /// Applies the patch over `base`.
    pub fn apply(self, mut base: ServerConfigInput) -> ServerConfigInput {
        if let Some(url) = self.url {
            base.url = url;
        }
        if self.transport.is_some() {
            base.transport = self.transport;
        }
        if self.auth_type.is_some() {
            base.auth_type = self.auth_type;
        }
        if self.api_key.is_some() {
            base.api_key = self.api_key;
        }
        if self.api_key_header.is_some() {
            base.api_key_header = self.api_key_header;
        }
        if self.bearer_token.is_some() {
            base.bearer_token = self.bearer_token;
        }
        if self.oauth.is_some() {
            base.oauth = self.oauth;
        }
        if let Some(headers) = self.headers {
            base.headers = headers;
        }
        if self.timeout.is_some() {
            base.timeout = self.timeout;
        }
        if self.retries.is_some() {
            base.retries = self.retries;
        }
        if self.retry_backoff_ms.is_some() {
            base.retry_backoff_ms = self.retry_backoff_ms;
        }
        base
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed table of server configurations.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, ServerConfig>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `config`, returning the configuration it replaced.
    pub async fn register(&self, config: ServerConfig) -> Option<ServerConfig> {
        self.servers
            .write()
            .await
            .insert(config.name.clone(), config)
    }

    pub async fn get(&self, name: &str) -> Option<ServerConfig> {
        self.servers.read().await.get(name).cloned()
    }

    /// Like [`ServerRegistry::get`] but fails with
    /// [`BridgeError::ServerNotFound`].
    pub async fn require(&self, name: &str) -> Result<ServerConfig> {
        self.get(name)
            .await
            .ok_or_else(|| BridgeError::ServerNotFound(name.to_string()).into())
    }

    /// Applies `patch` to the stored configuration and re-validates it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ServerNotFound`] for an unknown name, or the
    /// validation error of the merged configuration (the stored entry is
    /// then left unchanged).
    pub async fn update(&self, name: &str, patch: ServerConfigPatch) -> Result<ServerConfig> {
        let mut servers = self.servers.write().await;
        let current = servers
            .get(name)
            .ok_or_else(|| BridgeError::ServerNotFound(name.to_string()))?;
        let updated = patch.apply(current.to_input()).into_config(name)?;
        servers.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    /// Replaces the auth strategy of an existing server.
    pub async fn set_auth(&self, name: &str, auth: AuthStrategy) -> Option<ServerConfig> {
        let mut servers = self.servers.write().await;
        let config = servers.get_mut(name)?;
        config.auth = auth;
        Some(config.clone())
    }

    pub async fn remove(&self, name: &str) -> Option<ServerConfig> {
        self.servers.write().await.remove(name)
    }

    /// All configurations, sorted by name.
    pub async fn list(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> = self.servers.read().await.values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }
}
