//! Authorization server metadata discovery
//!
//! Resolves the OAuth endpoints protecting a remote MCP server. Discovery is
//! best-effort from start to finish: every failed fetch is logged and the
//! next strategy is tried, and when nothing answers a conventional set of
//! endpoints is synthesized under the server's origin. A call to
//! [`MetadataDiscovery::discover`] therefore never fails.
//!
//! # Discovery sequence
//!
//! 1. An explicitly configured metadata URL.
//! 2. RFC 8414 `/.well-known/oauth-authorization-server` at the origin and,
//!    for servers mounted under a sub-path, at the sibling well-known path.
//! 3. OpenID Connect `/.well-known/openid-configuration` at the origin.
//! 4. An unauthenticated `GET` of the server URL. A `WWW-Authenticate`
//!    challenge naming `resource_metadata` (RFC 9728) is followed to the
//!    listed authorization server; otherwise `realm`, `authorization_uri`,
//!    `token_uri` and `registration_uri` parameters are used directly.
//! 5. Synthesized `/authorize`, `/token` and `/register` endpoints.
//!
//! # References
//!
//! - RFC 8414 <https://www.rfc-editor.org/rfc/rfc8414>
//! - RFC 9728 <https://www.rfc-editor.org/rfc/rfc9728>
//! - OpenID Connect Discovery 1.0 <https://openid.net/specs/openid-connect-discovery-1_0.html>

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::auth::pkce::CHALLENGE_METHOD;
use crate::auth::store::AuthStateStore;

const OAUTH_WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";
const OPENID_WELL_KNOWN: &str = "/.well-known/openid-configuration";

// ---------------------------------------------------------------------------
// Metadata types
// ---------------------------------------------------------------------------

/// Where a metadata record came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    /// Fetched from a well-known or configured metadata document.
    #[default]
    Fetched,
    /// Built from parameters of a `WWW-Authenticate` challenge.
    Challenge,
    /// Conventional endpoints assumed under the server origin.
    Synthesized,
}

/// Authorization server metadata (RFC 8414 / OpenID Connect Discovery).
///
/// Only the two endpoints every flow needs are mandatory; a document
/// missing either is not a usable discovery result.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::discovery::{AuthorizationServerMetadata, MetadataSource};
///
/// let json = r#"{
///     "issuer": "https://auth.example.com",
///     "authorization_endpoint": "https://auth.example.com/authorize",
///     "token_endpoint": "https://auth.example.com/token",
///     "revocation_endpoint": "https://auth.example.com/revoke"
/// }"#;
///
/// let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.token_endpoint, "https://auth.example.com/token");
/// assert_eq!(meta.source, MetadataSource::Fetched);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Issuer identifier, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Authorization endpoint (RFC 6749 section 3.1).
    pub authorization_endpoint: String,

    /// Token endpoint (RFC 6749 section 3.2).
    pub token_endpoint: String,

    /// Dynamic Client Registration endpoint (RFC 7591).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Token revocation endpoint (RFC 7009).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_types_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Provenance of this record. Never read from remote documents.
    #[serde(default, skip_deserializing)]
    pub source: MetadataSource,

    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AuthorizationServerMetadata {
    /// Builds conventional endpoints under the origin of `server_url`.
    ///
    /// # Examples
    ///
    /// ```
    /// use url::Url;
    /// use mcpbridge::auth::discovery::AuthorizationServerMetadata;
    ///
    /// let url = Url::parse("https://mcp.example.com:8443/v1/mcp").unwrap();
    /// let meta = AuthorizationServerMetadata::synthesized(&url);
    /// assert_eq!(meta.authorization_endpoint, "https://mcp.example.com:8443/authorize");
    /// assert_eq!(meta.token_endpoint, "https://mcp.example.com:8443/token");
    /// ```
    pub fn synthesized(server_url: &Url) -> Self {
        let base = origin_of(server_url);
        Self::under_base(&base, MetadataSource::Synthesized)
    }

    fn under_base(base: &str, source: MetadataSource) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            issuer: Some(base.to_string()),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: Some(format!("{base}/register")),
            revocation_endpoint: None,
            scopes_supported: None,
            response_types_supported: Some(vec!["code".to_string()]),
            grant_types_supported: Some(vec![
                "authorization_code".to_string(),
                "client_credentials".to_string(),
                "refresh_token".to_string(),
            ]),
            code_challenge_methods_supported: Some(vec![CHALLENGE_METHOD.to_string()]),
            source,
            extra: HashMap::new(),
        }
    }
}

/// RFC 9728 protected resource metadata, reduced to what discovery follows.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
}

// ---------------------------------------------------------------------------
// MetadataDiscovery
// ---------------------------------------------------------------------------

/// Resolves and caches authorization server metadata per server URL.
#[derive(Debug, Clone)]
pub struct MetadataDiscovery {
    http: reqwest::Client,
    store: Arc<AuthStateStore>,
}

impl MetadataDiscovery {
    /// Creates a discovery service backed by the shared state store.
    pub fn new(http: reqwest::Client, store: Arc<AuthStateStore>) -> Self {
        Self { http, store }
    }

    /// Returns authorization server metadata for `server_url`.
    ///
    /// A cached record within its TTL is returned without network traffic.
    /// Otherwise the full discovery sequence runs and its result, even a
    /// synthesized one, is cached.
    ///
    /// # Arguments
    ///
    /// * `server_url` - Target MCP server URL (the cache key)
    /// * `metadata_url` - Explicit metadata document URL, tried first
    pub async fn discover(
        &self,
        server_url: &Url,
        metadata_url: Option<&str>,
    ) -> AuthorizationServerMetadata {
        if let Some(cached) = self.store.metadata(server_url).await {
            return cached;
        }

        let metadata = self.resolve(server_url, metadata_url).await;
        self.store.put_metadata(server_url, metadata.clone()).await;
        metadata
    }

    /// Issues an unauthenticated `GET` of the server URL asking for an event
    /// stream and returns the `WWW-Authenticate` challenge of a 401 or 403
    /// response.
    ///
    /// Only response headers are read.
    pub async fn probe(&self, server_url: &Url) -> Option<String> {
        let response = match self
            .http
            .get(server_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %server_url, error = %e, "Unauthenticated probe failed");
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::UNAUTHORIZED && status != reqwest::StatusCode::FORBIDDEN
        {
            return None;
        }

        response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn resolve(
        &self,
        server_url: &Url,
        metadata_url: Option<&str>,
    ) -> AuthorizationServerMetadata {
        if let Some(found) = self
            .first_success(&candidate_urls(server_url, metadata_url))
            .await
        {
            return found;
        }

        if let Some(challenge) = self.probe(server_url).await {
            if let Some(found) = self.from_challenge(server_url, &challenge).await {
                return found;
            }
        }

        warn!(
            url = %server_url,
            "No authorization server metadata found; assuming conventional endpoints"
        );
        AuthorizationServerMetadata::synthesized(server_url)
    }

    async fn first_success(&self, candidates: &[Url]) -> Option<AuthorizationServerMetadata> {
        for candidate in candidates {
            if let Some(found) = self.fetch_metadata(candidate).await {
                debug!(url = %candidate, "Discovered authorization server metadata");
                return Some(found);
            }
        }
        None
    }

    async fn fetch_metadata(&self, url: &Url) -> Option<AuthorizationServerMetadata> {
        let response = match self.http.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %url, error = %e, "Metadata candidate unreachable");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Metadata candidate rejected");
            return None;
        }

        match response.json::<AuthorizationServerMetadata>().await {
            Ok(mut metadata) => {
                metadata.source = MetadataSource::Fetched;
                Some(metadata)
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Metadata candidate is not a metadata document");
                None
            }
        }
    }

    async fn from_challenge(
        &self,
        server_url: &Url,
        challenge: &str,
    ) -> Option<AuthorizationServerMetadata> {
        if let Some(prm_url) = parse_resource_metadata_url(challenge) {
            if let Some(found) = self.from_protected_resource(&prm_url).await {
                return Some(found);
            }
        }

        metadata_from_challenge(server_url, challenge)
    }

    async fn from_protected_resource(&self, prm_url: &str) -> Option<AuthorizationServerMetadata> {
        let url = Url::parse(prm_url).ok()?;
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            debug!(url = prm_url, status = %response.status(), "Protected resource metadata unavailable");
            return None;
        }

        let prm: ProtectedResourceMetadata = response.json().await.ok()?;
        let issuer = prm
            .authorization_servers
            .first()
            .and_then(|s| Url::parse(s).ok())?;

        self.first_success(&issuer_candidate_urls(&issuer)).await
    }
}

// ---------------------------------------------------------------------------
// Candidate construction and challenge parsing
// ---------------------------------------------------------------------------

/// Ordered, de-duplicated metadata URLs to try for `server_url`.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use mcpbridge::auth::discovery::candidate_urls;
///
/// let url = Url::parse("https://mcp.example.com/api/mcp").unwrap();
/// let candidates: Vec<String> = candidate_urls(&url, None)
///     .into_iter()
///     .map(|u| u.to_string())
///     .collect();
/// assert_eq!(
///     candidates,
///     vec![
///         "https://mcp.example.com/.well-known/oauth-authorization-server",
///         "https://mcp.example.com/api/.well-known/oauth-authorization-server",
///         "https://mcp.example.com/.well-known/openid-configuration",
///     ]
/// );
/// ```
pub fn candidate_urls(server_url: &Url, metadata_url: Option<&str>) -> Vec<Url> {
    let origin = origin_of(server_url);
    let mut raw: Vec<String> = Vec::with_capacity(4);

    if let Some(explicit) = metadata_url {
        raw.push(explicit.to_string());
    }

    raw.push(format!("{origin}{OAUTH_WELL_KNOWN}"));

    let path = server_url.path().trim_end_matches('/');
    if let Some((prefix, _last)) = path.rsplit_once('/') {
        if !prefix.is_empty() {
            raw.push(format!("{origin}{prefix}{OAUTH_WELL_KNOWN}"));
        }
    }

    raw.push(format!("{origin}{OPENID_WELL_KNOWN}"));

    dedup_parsed(raw)
}

/// Well-known metadata URLs for an issuer taken from protected resource
/// metadata.
fn issuer_candidate_urls(issuer: &Url) -> Vec<Url> {
    let origin = origin_of(issuer);
    let path = issuer.path().trim_end_matches('/');

    let mut raw = Vec::with_capacity(4);
    if !path.is_empty() {
        raw.push(format!("{origin}{OAUTH_WELL_KNOWN}{path}"));
        raw.push(format!("{origin}{OPENID_WELL_KNOWN}{path}"));
    }
    raw.push(format!("{origin}{OAUTH_WELL_KNOWN}"));
    raw.push(format!("{origin}{OPENID_WELL_KNOWN}"));

    dedup_parsed(raw)
}

fn dedup_parsed(raw: Vec<String>) -> Vec<Url> {
    let mut out: Vec<Url> = Vec::with_capacity(raw.len());
    for candidate in raw {
        match Url::parse(&candidate) {
            Ok(url) => {
                if !out.contains(&url) {
                    out.push(url);
                }
            }
            Err(e) => warn!(url = %candidate, error = %e, "Skipping malformed metadata URL"),
        }
    }
    out
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Extracts the `resource_metadata` attribute of a `WWW-Authenticate`
/// challenge, quoted or not.
pub fn parse_resource_metadata_url(www_authenticate: &str) -> Option<String> {
    let key = "resource_metadata=";
    let pos = www_authenticate.find(key)?;
    let rest = &www_authenticate[pos + key.len()..];

    if let Some(inner) = rest.strip_prefix('"') {
        let end = inner.find('"')?;
        Some(inner[..end].to_string())
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ',')
            .unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

/// Collects every `key="value"` pair of a challenge header.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::discovery::parse_challenge_params;
///
/// let params = parse_challenge_params(
///     r#"Bearer realm="https://auth.example.com", token_uri="https://auth.example.com/t""#,
/// );
/// assert_eq!(params["realm"], "https://auth.example.com");
/// assert_eq!(params["token_uri"], "https://auth.example.com/t");
/// ```
pub fn parse_challenge_params(www_authenticate: &str) -> HashMap<String, String> {
    static PARAM: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PARAM.get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).ok()) else {
        return HashMap::new();
    };

    re.captures_iter(www_authenticate)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Builds metadata from challenge parameters when they name any endpoint.
///
/// A `realm` is only used as an endpoint base when it is itself an
/// absolute http(s) URL.
fn metadata_from_challenge(
    server_url: &Url,
    www_authenticate: &str,
) -> Option<AuthorizationServerMetadata> {
    let params = parse_challenge_params(www_authenticate);

    let realm = params
        .get("realm")
        .and_then(|r| Url::parse(r).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"));
    let authorization_uri = params.get("authorization_uri").cloned();
    let token_uri = params.get("token_uri").cloned();
    let registration_uri = params.get("registration_uri").cloned();

    if realm.is_none() && authorization_uri.is_none() && token_uri.is_none() {
        return None;
    }

    let base = realm
        .map(|u| u.as_str().trim_end_matches('/').to_string())
        .unwrap_or_else(|| origin_of(server_url));

    let mut metadata = AuthorizationServerMetadata::under_base(&base, MetadataSource::Challenge);
    if let Some(uri) = authorization_uri {
        metadata.authorization_endpoint = uri;
    }
    if let Some(uri) = token_uri {
        metadata.token_endpoint = uri;
    }
    if let Some(uri) = registration_uri {
        metadata.registration_endpoint = Some(uri);
    }

    debug!(url = %server_url, "Using endpoints from WWW-Authenticate challenge");
    Some(metadata)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn as_strings(urls: Vec<Url>) -> Vec<String> {
        urls.into_iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_candidate_urls_root_path() {
        let candidates = as_strings(candidate_urls(&url("https://mcp.example.com/"), None));
        assert_eq!(
            candidates,
            vec![
                "https://mcp.example.com/.well-known/oauth-authorization-server",
                "https://mcp.example.com/.well-known/openid-configuration",
            ]
        );
    }

    #[test]
    fn test_candidate_urls_single_segment_dedups_sibling() {
        let candidates = as_strings(candidate_urls(&url("https://mcp.example.com/mcp"), None));
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_candidate_urls_nested_path_includes_sibling() {
        let candidates = as_strings(candidate_urls(
            &url("https://mcp.example.com/tenants/acme/mcp"),
            None,
        ));
        assert_eq!(
            candidates[1],
            "https://mcp.example.com/tenants/acme/.well-known/oauth-authorization-server"
        );
    }

    #[test]
    fn test_candidate_urls_explicit_first() {
        let candidates = as_strings(candidate_urls(
            &url("https://mcp.example.com/api/mcp"),
            Some("https://auth.example.com/meta.json"),
        ));
        assert_eq!(candidates[0], "https://auth.example.com/meta.json");
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn test_candidate_urls_explicit_duplicate_is_removed() {
        let candidates = as_strings(candidate_urls(
            &url("https://mcp.example.com/"),
            Some("https://mcp.example.com/.well-known/oauth-authorization-server"),
        ));
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_candidate_urls_keep_port() {
        let candidates = as_strings(candidate_urls(&url("http://127.0.0.1:9000/mcp"), None));
        assert!(candidates[0].starts_with("http://127.0.0.1:9000/"));
    }

    #[test]
    fn test_issuer_candidate_urls_with_path() {
        let candidates = as_strings(issuer_candidate_urls(&url("https://auth.example.com/t1")));
        assert_eq!(
            candidates,
            vec![
                "https://auth.example.com/.well-known/oauth-authorization-server/t1",
                "https://auth.example.com/.well-known/openid-configuration/t1",
                "https://auth.example.com/.well-known/oauth-authorization-server",
                "https://auth.example.com/.well-known/openid-configuration",
            ]
        );
    }

    #[test]
    fn test_parse_resource_metadata_url_quoted() {
        let header = r#"Bearer realm="x", resource_metadata="https://a.example.com/.well-known/oauth-protected-resource""#;
        assert_eq!(
            parse_resource_metadata_url(header).as_deref(),
            Some("https://a.example.com/.well-known/oauth-protected-resource")
        );
    }

    #[test]
    fn test_parse_resource_metadata_url_unquoted() {
        let header = "Bearer resource_metadata=https://a.example.com/prm, error=x";
        assert_eq!(
            parse_resource_metadata_url(header).as_deref(),
            Some("https://a.example.com/prm")
        );
    }

    #[test]
    fn test_parse_resource_metadata_url_absent() {
        assert!(parse_resource_metadata_url(r#"Bearer realm="x""#).is_none());
    }

    #[test]
    fn test_parse_challenge_params_ignores_unquoted() {
        let params = parse_challenge_params(r#"Bearer error=invalid_token, realm="r""#);
        assert_eq!(params.len(), 1);
        assert_eq!(params["realm"], "r");
    }

    #[test]
    fn test_metadata_from_challenge_uses_explicit_uris() {
        let header = r#"Bearer authorization_uri="https://auth.example.com/oauth/authorize", token_uri="https://auth.example.com/oauth/token""#;
        let meta = metadata_from_challenge(&url("https://mcp.example.com/mcp"), header).unwrap();
        assert_eq!(
            meta.authorization_endpoint,
            "https://auth.example.com/oauth/authorize"
        );
        assert_eq!(meta.token_endpoint, "https://auth.example.com/oauth/token");
        assert_eq!(
            meta.registration_endpoint.as_deref(),
            Some("https://mcp.example.com/register")
        );
        assert_eq!(meta.source, MetadataSource::Challenge);
    }

    #[test]
    fn test_metadata_from_challenge_realm_url_is_base() {
        let header = r#"Bearer realm="https://auth.example.com/tenant""#;
        let meta = metadata_from_challenge(&url("https://mcp.example.com/mcp"), header).unwrap();
        assert_eq!(
            meta.authorization_endpoint,
            "https://auth.example.com/tenant/authorize"
        );
    }

    #[test]
    fn test_metadata_from_challenge_plain_realm_is_ignored() {
        let header = r#"Bearer realm="mcp""#;
        assert!(metadata_from_challenge(&url("https://mcp.example.com/mcp"), header).is_none());
    }

    #[test]
    fn test_synthesized_defaults() {
        let meta = AuthorizationServerMetadata::synthesized(&url("https://mcp.example.com/a/b"));
        assert_eq!(meta.source, MetadataSource::Synthesized);
        assert_eq!(
            meta.registration_endpoint.as_deref(),
            Some("https://mcp.example.com/register")
        );
        assert_eq!(
            meta.code_challenge_methods_supported,
            Some(vec!["S256".to_string()])
        );
        assert_eq!(meta.grant_types_supported.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn test_metadata_requires_both_endpoints() {
        let json = r#"{"issuer":"https://a","authorization_endpoint":"https://a/authorize"}"#;
        assert!(serde_json::from_str::<AuthorizationServerMetadata>(json).is_err());
    }

    #[test]
    fn test_metadata_captures_extra_fields() {
        let json = r#"{
            "authorization_endpoint": "https://a/authorize",
            "token_endpoint": "https://a/token",
            "custom_field": "custom_value"
        }"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.extra["custom_field"], "custom_value");
    }
}
