//! OAuth 2.1 engine
//!
//! [`OAuthEngine`] drives every token-acquiring flow the bridge supports
//! for remote servers:
//!
//! - the browser-based authorization-code flow with PKCE, split into
//!   [`OAuthEngine::initiate`] and [`OAuthEngine::complete`] around the
//!   user's visit to the authorization server;
//! - the client-credentials grant;
//! - silent refresh, both on demand and lazily from
//!   [`OAuthEngine::access_token`];
//! - best-effort revocation.
//!
//! Tokens live only in the shared [`AuthStateStore`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::discovery::{AuthorizationServerMetadata, MetadataDiscovery, MetadataSource};
use crate::auth::pkce;
use crate::auth::registration::ClientRegistrar;
use crate::auth::store::{
    AuthStateStore, GrantKind, PendingAuthorization, TokenRecord, PENDING_AUTHORIZATION_TTL_SECS,
};
use crate::config::{resolve_callback_url, CallbackSettings};
use crate::error::{AuthorizationRequired, BridgeError, Result};

/// Tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_WINDOW_SECS: i64 = 300;

const STATE_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Settings and options
// ---------------------------------------------------------------------------

/// Process-wide engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// `client_name` sent on dynamic registration.
    pub client_name: String,
    /// Inputs for computing the OAuth callback URL.
    pub callback: CallbackSettings,
}

/// Per-initiation options, usually taken from a server's OAuth settings.
#[derive(Debug, Clone, Default)]
pub struct InitiateOptions {
    /// Pre-registered client id. Dynamic registration is used when absent.
    pub client_id: Option<String>,
    /// Client secret for confidential clients.
    pub client_secret: Option<String>,
    /// Scopes to request.
    pub scopes: Vec<String>,
    /// Explicit authorization server metadata URL.
    pub metadata_url: Option<String>,
    /// Explicit callback base URL.
    pub callback_url: Option<String>,
    /// Overrides merged into the dynamic registration request.
    pub client_metadata: Option<Map<String, Value>>,
}

/// Token state of one server, safe to expose to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthStatus {
    pub has_tokens: bool,
    /// Tokens exist and have not reached their expiry.
    pub valid: bool,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub grant_kind: Option<GrantKind>,
    pub token_type: Option<String>,
    /// Provenance of cached authorization server metadata, if any.
    pub metadata_source: Option<MetadataSource>,
}

// ---------------------------------------------------------------------------
// Token endpoint response
// ---------------------------------------------------------------------------

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn expires_at(&self, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expires_in?).ok()?;
        issued_at.checked_add_signed(Duration::try_seconds(secs)?)
    }

    fn into_record(self, origin: TokenOrigin) -> TokenRecord {
        let issued_at = Utc::now();
        TokenRecord {
            expires_at: self.expires_at(issued_at),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            scope: self.scope,
            server_url: origin.server_url,
            client_id: origin.client_id,
            client_secret: origin.client_secret,
            metadata_url: origin.metadata_url,
            grant_kind: origin.grant_kind,
            issued_at,
        }
    }

    /// Lays a refresh response over an existing record. Fields the
    /// response omits keep their previous values, except the expiry which
    /// is always recomputed.
    fn merge_into(self, previous: TokenRecord) -> TokenRecord {
        let issued_at = Utc::now();
        TokenRecord {
            expires_at: self.expires_at(issued_at),
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous.refresh_token),
            token_type: self.token_type,
            scope: self.scope.or(previous.scope),
            issued_at,
            ..previous
        }
    }
}

struct TokenOrigin {
    server_url: Url,
    client_id: String,
    client_secret: Option<String>,
    metadata_url: Option<String>,
    grant_kind: GrantKind,
}

/// Outcome of a token endpoint call that reached the server.
enum TokenOutcome {
    Issued(TokenResponse),
    /// Non-2xx answer, with the formatted status and body.
    Rejected(String),
}

// ---------------------------------------------------------------------------
// OAuthEngine
// ---------------------------------------------------------------------------

/// OAuth 2.1 client engine shared by every server.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::engine::{EngineSettings, OAuthEngine};
/// use mcpbridge::config::CallbackSettings;
///
/// let engine = OAuthEngine::from_settings(
///     reqwest::Client::new(),
///     None,
///     EngineSettings {
///         client_name: "mcpbridge".to_string(),
///         callback: CallbackSettings::default(),
///     },
/// );
/// assert!(engine.store().metadata_ttl().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct OAuthEngine {
    http: reqwest::Client,
    store: Arc<AuthStateStore>,
    discovery: MetadataDiscovery,
    registrar: ClientRegistrar,
    settings: EngineSettings,
}

impl OAuthEngine {
    /// Creates an engine from its collaborators.
    pub fn new(
        http: reqwest::Client,
        store: Arc<AuthStateStore>,
        discovery: MetadataDiscovery,
        registrar: ClientRegistrar,
        settings: EngineSettings,
    ) -> Self {
        Self {
            http,
            store,
            discovery,
            registrar,
            settings,
        }
    }

    /// Creates an engine with a fresh store and default collaborators.
    ///
    /// # Arguments
    ///
    /// * `http` - Client used for every authorization server request
    /// * `metadata_ttl` - Metadata cache lifetime (`None` never expires)
    /// * `settings` - Client name and callback inputs
    pub fn from_settings(
        http: reqwest::Client,
        metadata_ttl: Option<Duration>,
        settings: EngineSettings,
    ) -> Self {
        let store = Arc::new(AuthStateStore::new(metadata_ttl));
        let discovery = MetadataDiscovery::new(http.clone(), Arc::clone(&store));
        let registrar =
            ClientRegistrar::new(http.clone(), Arc::clone(&store), settings.client_name.clone());
        Self::new(http, store, discovery, registrar, settings)
    }

    /// Shared state store.
    pub fn store(&self) -> &Arc<AuthStateStore> {
        &self.store
    }

    /// Metadata discovery service.
    pub fn discovery(&self) -> &MetadataDiscovery {
        &self.discovery
    }

    /// Starts an authorization-code flow.
    ///
    /// Discovers metadata, resolves a client id (explicit, cached
    /// registration or fresh dynamic registration), generates PKCE material
    /// and a state token, and records a pending authorization valid for ten
    /// minutes.
    ///
    /// # Returns
    ///
    /// The authorization URL, the state and the remaining validity, ready
    /// to hand to the user.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] when no client id can be obtained and
    /// [`BridgeError::OAuth`] when the discovered authorization endpoint is
    /// not a valid URL.
    pub async fn initiate(
        &self,
        server_name: &str,
        server_url: &Url,
        options: &InitiateOptions,
    ) -> Result<AuthorizationRequired> {
        let swept = self.store.sweep_expired_pending().await;
        if swept > 0 {
            debug!(swept, "Dropped expired pending authorizations");
        }

        let metadata = self
            .discovery
            .discover(server_url, options.metadata_url.as_deref())
            .await;
        let redirect_uri =
            resolve_callback_url(options.callback_url.as_deref(), &self.settings.callback);

        let (client_id, client_secret) = match &options.client_id {
            Some(id) => (id.clone(), options.client_secret.clone()),
            None => {
                let registration = self
                    .registrar
                    .register(
                        server_url,
                        &metadata,
                        &redirect_uri,
                        options.client_metadata.as_ref(),
                    )
                    .await
                    .ok_or_else(|| {
                        BridgeError::Config(format!(
                            "server '{server_name}' has no OAuth client id and dynamic registration is unavailable"
                        ))
                    })?;
                (registration.client_id, registration.client_secret)
            }
        };

        let challenge = pkce::generate();

        for _ in 0..STATE_ATTEMPTS {
            let state = pkce::generate_state();
            let authorization_url = build_authorization_url(
                &metadata,
                &client_id,
                &redirect_uri,
                &state,
                &challenge.challenge,
                &options.scopes,
            )?;

            let created_at = Utc::now();
            let pending = PendingAuthorization {
                server_name: server_name.to_string(),
                server_url: server_url.clone(),
                code_verifier: challenge.verifier.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                scopes: options.scopes.clone(),
                redirect_uri: redirect_uri.clone(),
                metadata_url: options.metadata_url.clone(),
                created_at,
                expires_at: created_at + Duration::seconds(PENDING_AUTHORIZATION_TTL_SECS),
            };
            let expires_in = pending.remaining_secs(created_at);

            if self.store.insert_pending(state.clone(), pending).await {
                info!(server = server_name, "Authorization flow initiated");
                return Ok(AuthorizationRequired {
                    server_name: server_name.to_string(),
                    authorization_url,
                    state,
                    expires_in,
                });
            }
        }

        Err(BridgeError::OAuth("could not allocate a unique state token".to_string()).into())
    }

    /// Completes an authorization-code flow from its callback.
    ///
    /// The pending authorization is consumed whatever the outcome.
    ///
    /// # Returns
    ///
    /// The name of the server that is now authorized.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InvalidState`] when no pending authorization matches
    /// - [`BridgeError::AuthorizationExpired`] when it is past its expiry
    /// - [`BridgeError::OAuth`] when the token endpoint refuses the code
    pub async fn complete(&self, code: &str, state: &str) -> Result<String> {
        let pending = self
            .store
            .take_pending(state)
            .await
            .ok_or(BridgeError::InvalidState)?;

        if pending.is_expired_at(Utc::now()) {
            debug!(server = %pending.server_name, "Callback arrived after expiry");
            return Err(BridgeError::AuthorizationExpired.into());
        }

        let metadata = self
            .discovery
            .discover(&pending.server_url, pending.metadata_url.as_deref())
            .await;

        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("client_id", pending.client_id.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        if let Some(secret) = pending.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let response = match self.token_request(&metadata.token_endpoint, &params).await? {
            TokenOutcome::Issued(r) => r,
            TokenOutcome::Rejected(detail) => return Err(BridgeError::OAuth(detail).into()),
        };

        let record = response.into_record(TokenOrigin {
            server_url: pending.server_url.clone(),
            client_id: pending.client_id.clone(),
            client_secret: pending.client_secret.clone(),
            metadata_url: pending.metadata_url.clone(),
            grant_kind: GrantKind::AuthorizationCode,
        });
        self.store.put_tokens(&pending.server_name, record).await;

        info!(server = %pending.server_name, "Authorization code exchanged");
        Ok(pending.server_name)
    }

    /// Obtains tokens with the client-credentials grant.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OAuth`] when the token endpoint refuses the
    /// credentials or cannot be reached.
    pub async fn client_credentials_grant(
        &self,
        server_name: &str,
        server_url: &Url,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
        metadata_url: Option<&str>,
    ) -> Result<()> {
        let metadata = self.discovery.discover(server_url, metadata_url).await;

        let scope = scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        let response = match self.token_request(&metadata.token_endpoint, &params).await? {
            TokenOutcome::Issued(r) => r,
            TokenOutcome::Rejected(detail) => return Err(BridgeError::OAuth(detail).into()),
        };

        let record = response.into_record(TokenOrigin {
            server_url: server_url.clone(),
            client_id: client_id.to_string(),
            client_secret: Some(client_secret.to_string()),
            metadata_url: metadata_url.map(str::to_string),
            grant_kind: GrantKind::ClientCredentials,
        });
        self.store.put_tokens(server_name, record).await;

        info!(server = server_name, "Client credentials grant succeeded");
        Ok(())
    }

    /// Returns a usable access token for `server_name`, if any.
    ///
    /// Tokens within [`REFRESH_WINDOW_SECS`] of expiry are refreshed first
    /// when a refresh token exists. A failed refresh here yields `None` but
    /// leaves the record in place. An expired record without a refresh
    /// token is deleted.
    pub async fn access_token(&self, server_name: &str) -> Option<String> {
        let record = self.store.tokens(server_name).await?;
        let now = Utc::now();

        if !record.expires_within(now, Duration::seconds(REFRESH_WINDOW_SECS)) {
            return Some(record.access_token);
        }

        if record.refresh_token.is_some() {
            return match self.exchange_refresh(&record).await {
                Ok(TokenOutcome::Issued(response)) => {
                    let merged = response.merge_into(record);
                    let token = merged.access_token.clone();
                    self.store.put_tokens(server_name, merged).await;
                    debug!(server = server_name, "Access token refreshed");
                    Some(token)
                }
                Ok(TokenOutcome::Rejected(detail)) => {
                    warn!(server = server_name, detail = %detail, "Token refresh rejected");
                    None
                }
                Err(e) => {
                    warn!(server = server_name, error = %e, "Token refresh failed");
                    None
                }
            };
        }

        if record.is_expired_at(now) {
            self.store.remove_tokens(server_name).await;
            debug!(server = server_name, "Discarded expired token without refresh token");
            return None;
        }

        Some(record.access_token)
    }

    /// Refreshes the tokens of `server_name` unconditionally.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::OAuth`] when there is nothing to refresh
    /// or when the token endpoint rejects the refresh token, in which case
    /// the record is deleted.
    pub async fn refresh(&self, server_name: &str) -> Result<TokenRecord> {
        let record = self.store.tokens(server_name).await.ok_or_else(|| {
            BridgeError::OAuth(format!("no tokens stored for server '{server_name}'"))
        })?;
        if record.refresh_token.is_none() {
            return Err(BridgeError::OAuth(format!(
                "no refresh token available for server '{server_name}'"
            ))
            .into());
        }

        match self.exchange_refresh(&record).await? {
            TokenOutcome::Issued(response) => {
                let merged = response.merge_into(record);
                self.store.put_tokens(server_name, merged.clone()).await;
                info!(server = server_name, "Tokens refreshed");
                Ok(merged)
            }
            TokenOutcome::Rejected(detail) => {
                self.store.remove_tokens(server_name).await;
                warn!(server = server_name, "Refresh rejected; credentials discarded");
                Err(BridgeError::OAuth(detail).into())
            }
        }
    }

    /// Returns `true` when tokens exist and are either unexpired or
    /// recoverable through a refresh token.
    pub async fn has_valid_tokens(&self, server_name: &str) -> bool {
        match self.store.tokens(server_name).await {
            Some(record) => record.is_usable_at(Utc::now()),
            None => false,
        }
    }

    /// Revokes and forgets the tokens of `server_name`.
    ///
    /// Revocation is attempted only when cached metadata names a
    /// revocation endpoint; failures are logged. The local record is always
    /// deleted.
    pub async fn revoke(&self, server_name: &str) {
        let Some(record) = self.store.remove_tokens(server_name).await else {
            return;
        };

        let endpoint = self
            .store
            .metadata(&record.server_url)
            .await
            .and_then(|m| m.revocation_endpoint);
        let Some(endpoint) = endpoint else {
            debug!(server = server_name, "No revocation endpoint known");
            return;
        };

        let mut tokens = vec![("access_token", record.access_token.as_str())];
        if let Some(refresh) = record.refresh_token.as_deref() {
            tokens.push(("refresh_token", refresh));
        }

        for (hint, token) in tokens {
            let mut params: Vec<(&str, &str)> = vec![
                ("token", token),
                ("token_type_hint", hint),
                ("client_id", record.client_id.as_str()),
            ];
            if let Some(secret) = record.client_secret.as_deref() {
                params.push(("client_secret", secret));
            }

            match self.http.post(&endpoint).form(&params).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(server = server_name, hint, "Token revoked");
                }
                Ok(resp) => {
                    warn!(server = server_name, hint, status = %resp.status(), "Revocation rejected");
                }
                Err(e) => {
                    warn!(server = server_name, hint, error = %e, "Revocation request failed");
                }
            }
        }
    }

    /// Describes the token state of `server_name` without exposing secrets.
    pub async fn status(&self, server_name: &str, server_url: Option<&Url>) -> OAuthStatus {
        let metadata_source = match server_url {
            Some(url) => self.store.metadata(url).await.map(|m| m.source),
            None => None,
        };

        match self.store.tokens(server_name).await {
            Some(record) => OAuthStatus {
                has_tokens: true,
                valid: !record.is_expired_at(Utc::now()),
                has_refresh_token: record.refresh_token.is_some(),
                expires_at: record.expires_at,
                scope: record.scope,
                grant_kind: Some(record.grant_kind),
                token_type: Some(record.token_type),
                metadata_source,
            },
            None => OAuthStatus {
                has_tokens: false,
                valid: false,
                has_refresh_token: false,
                expires_at: None,
                scope: None,
                grant_kind: None,
                token_type: None,
                metadata_source,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn exchange_refresh(&self, record: &TokenRecord) -> Result<TokenOutcome> {
        let refresh_token = record.refresh_token.as_deref().ok_or_else(|| {
            BridgeError::OAuth("no refresh token available".to_string())
        })?;

        let metadata = self
            .discovery
            .discover(&record.server_url, record.metadata_url.as_deref())
            .await;

        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", record.client_id.as_str()),
        ];
        if let Some(secret) = record.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        self.token_request(&metadata.token_endpoint, &params).await
    }

    async fn token_request(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<TokenOutcome> {
        let resp = self
            .http
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| BridgeError::OAuth(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Ok(TokenOutcome::Rejected(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let raw: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::OAuth(format!("failed to parse token response: {e}")))?;

        Ok(TokenOutcome::Issued(raw))
    }
}

/// Builds the authorization request URL.
///
/// Existing query parameters of the endpoint are preserved.
///
/// # Errors
///
/// Returns [`BridgeError::OAuth`] when the endpoint is not a valid URL.
pub fn build_authorization_url(
    metadata: &AuthorizationServerMetadata,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
    scopes: &[String],
) -> Result<String> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| BridgeError::OAuth(format!("invalid authorization endpoint URL: {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", client_id);
        query.append_pair("redirect_uri", redirect_uri);
        query.append_pair("state", state);
        query.append_pair("code_challenge", code_challenge);
        query.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
        if !scopes.is_empty() {
            query.append_pair("scope", &scopes.join(" "));
        }
    }

    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
