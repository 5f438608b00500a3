//! Configuration management for mcpbridge
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::registry::{ServerConfig, ServerConfigInput};

/// Path appended to the resolved base URL to form the OAuth redirect URI.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Main configuration structure for mcpbridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Explicit public base URL of this bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Hosting platform hints used for callback URL resolution
    #[serde(default)]
    pub platform: PlatformSettings,

    /// OAuth client behavior
    #[serde(default)]
    pub oauth: OAuthClientSettings,

    /// Servers registered at startup, keyed by name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfigInput>,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Hosting platform hints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Public URL assigned by the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,

    /// Application name, templated into `https://{app_name}.{domain}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    #[serde(default = "default_platform_domain")]
    pub domain: String,
}

fn default_platform_domain() -> String {
    "herokuapp.com".to_string()
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            app_url: None,
            app_name: None,
            domain: default_platform_domain(),
        }
    }
}

/// OAuth client behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientSettings {
    /// `client_name` sent on dynamic registration
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Lifetime of cached authorization server metadata; `0` never expires
    #[serde(default = "default_metadata_ttl_seconds")]
    pub metadata_ttl_seconds: u64,

    /// Probe servers configured without auth for an OAuth challenge
    #[serde(default = "default_probe_unauthenticated")]
    pub probe_unauthenticated: bool,

    /// Timeout for requests to authorization servers
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_metadata_ttl_seconds() -> u64 {
    3600
}

fn default_probe_unauthenticated() -> bool {
    true
}

fn default_http_timeout_seconds() -> u64 {
    30
}

impl Default for OAuthClientSettings {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            metadata_ttl_seconds: default_metadata_ttl_seconds(),
            probe_unauthenticated: default_probe_unauthenticated(),
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

impl OAuthClientSettings {
    /// Metadata cache TTL, or `None` when caching never expires.
    pub fn metadata_ttl(&self) -> Option<chrono::Duration> {
        if self.metadata_ttl_seconds == 0 {
            return None;
        }
        i64::try_from(self.metadata_ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }
}

/// Inputs for computing the OAuth callback URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackSettings {
    pub base_url: Option<String>,
    pub app_url: Option<String>,
    pub app_name: Option<String>,
    pub platform_domain: String,
    pub port: u16,
}

/// Resolves the OAuth redirect URI.
///
/// The first non-empty source wins: `explicit`, the configured base URL, the
/// platform app URL, `https://{app_name}.{platform_domain}`, then
/// `http://localhost:{port}`. A trailing slash is stripped and
/// [`CALLBACK_PATH`] is appended unless already present.
///
/// # Examples
///
/// ```
/// use mcpbridge::config::{resolve_callback_url, CallbackSettings};
///
/// let settings = CallbackSettings {
///     app_name: Some("my-bridge".to_string()),
///     platform_domain: "herokuapp.com".to_string(),
///     port: 3000,
///     ..CallbackSettings::default()
/// };
/// assert_eq!(
///     resolve_callback_url(None, &settings),
///     "https://my-bridge.herokuapp.com/oauth/callback"
/// );
/// assert_eq!(
///     resolve_callback_url(Some("https://x.example.com/"), &settings),
///     "https://x.example.com/oauth/callback"
/// );
/// ```
pub fn resolve_callback_url(explicit: Option<&str>, settings: &CallbackSettings) -> String {
    let non_empty = |v: Option<&str>| v.map(str::trim).filter(|s| !s.is_empty()).map(String::from);

    let base = non_empty(explicit)
        .or_else(|| non_empty(settings.base_url.as_deref()))
        .or_else(|| non_empty(settings.app_url.as_deref()))
        .or_else(|| {
            non_empty(settings.app_name.as_deref())
                .map(|name| format!("https://{}.{}", name, settings.platform_domain))
        })
        .unwrap_or_else(|| format!("http://localhost:{}", settings.port));

    let base = base.trim_end_matches('/');
    if base.ends_with(CALLBACK_PATH) {
        base.to_string()
    } else {
        format!("{base}{CALLBACK_PATH}")
    }
}

impl BridgeConfig {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed, or if
    /// `MCP_SERVERS` is not a JSON object of server inputs
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars()?;
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("MCP_BRIDGE_HOST") {
            self.server.host = host;
        }

        for var in ["PORT", "MCP_BRIDGE_PORT"] {
            if let Ok(port) = std::env::var(var) {
                if let Ok(value) = port.parse() {
                    self.server.port = value;
                } else {
                    tracing::warn!("Invalid {}: {}", var, port);
                }
            }
        }

        if let Ok(base_url) = std::env::var("MCP_BRIDGE_BASE_URL") {
            self.base_url = Some(base_url);
        }

        if let Ok(app_url) = std::env::var("MCP_BRIDGE_APP_URL") {
            self.platform.app_url = Some(app_url);
        }

        for var in ["HEROKU_APP_NAME", "MCP_BRIDGE_APP_NAME"] {
            if let Ok(app_name) = std::env::var(var) {
                self.platform.app_name = Some(app_name);
            }
        }

        if let Ok(ttl) = std::env::var("MCP_BRIDGE_METADATA_TTL") {
            if let Ok(value) = ttl.parse() {
                self.oauth.metadata_ttl_seconds = value;
            } else {
                tracing::warn!("Invalid MCP_BRIDGE_METADATA_TTL: {}", ttl);
            }
        }

        if let Ok(json_logs) = std::env::var("MCP_BRIDGE_JSON_LOGS") {
            match json_logs.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.json_logs = true,
                "0" | "false" | "no" => self.json_logs = false,
                _ => tracing::warn!("Invalid MCP_BRIDGE_JSON_LOGS: {}", json_logs),
            }
        }

        if let Ok(raw) = std::env::var("MCP_SERVERS") {
            let servers: BTreeMap<String, ServerConfigInput> = serde_json::from_str(&raw)
                .map_err(|e| BridgeError::Config(format!("Failed to parse MCP_SERVERS: {}", e)))?;
            self.servers.extend(servers);
        }

        Ok(())
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.json_logs {
            self.json_logs = true;
        }

        if let crate::cli::Commands::Serve { host, port } = &cli.command {
            if let Some(host) = host {
                self.server.host = host.clone();
            }
            if let Some(port) = port {
                self.server.port = *port;
            }
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first failing check
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(BridgeError::Config("server.port must be greater than 0".to_string()).into());
        }

        if self.server.host.trim().is_empty() {
            return Err(BridgeError::Config("server.host cannot be empty".to_string()).into());
        }

        if self.oauth.client_name.trim().is_empty() {
            return Err(BridgeError::Config("oauth.client_name cannot be empty".to_string()).into());
        }

        if self.oauth.http_timeout_seconds == 0 {
            return Err(BridgeError::Config(
                "oauth.http_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        self.server_configs().map(|_| ())
    }

    /// Converts the static server inputs into validated configurations.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first invalid server
    pub fn server_configs(&self) -> Result<Vec<ServerConfig>> {
        self.servers
            .iter()
            .map(|(name, input)| {
                input.clone().into_config(name).map_err(|e| {
                    anyhow::Error::from(BridgeError::Config(format!(
                        "Invalid server '{}': {}",
                        name, e
                    )))
                })
            })
            .collect()
    }

    /// Callback inputs derived from this configuration.
    pub fn callback_settings(&self) -> CallbackSettings {
        CallbackSettings {
            base_url: self.base_url.clone(),
            app_url: self.platform.app_url.clone(),
            app_name: self.platform.app_name.clone(),
            platform_domain: self.platform.domain.clone(),
            port: self.server.port,
        }
    }
}
