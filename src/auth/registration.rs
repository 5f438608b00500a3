//! Dynamic Client Registration (RFC 7591)
//!
//! Registers the bridge as a public OAuth client with authorization servers
//! that advertise a `registration_endpoint`. Registrations are cached per
//! server URL; a new redirect URI replaces the cached entry.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::discovery::AuthorizationServerMetadata;
use crate::auth::store::{AuthStateStore, ClientRegistration};

/// Minimal registration response (RFC 7591 section 3.2.1).
#[derive(Debug, Deserialize)]
struct DcrResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// Performs and caches dynamic client registrations.
#[derive(Debug, Clone)]
pub struct ClientRegistrar {
    http: reqwest::Client,
    store: Arc<AuthStateStore>,
    client_name: String,
}

impl ClientRegistrar {
    /// Creates a registrar.
    ///
    /// # Arguments
    ///
    /// * `http` - Shared HTTP client
    /// * `store` - State store holding the registration cache
    /// * `client_name` - Default `client_name` sent on registration
    pub fn new(http: reqwest::Client, store: Arc<AuthStateStore>, client_name: String) -> Self {
        Self {
            http,
            store,
            client_name,
        }
    }

    /// Returns a registration for `server_url`, registering if needed.
    ///
    /// A cached registration is reused when it was made for the same
    /// `redirect_uri`. Otherwise the request body is the
    /// public-client default (see [`registration_body`]) with `overrides`
    /// merged over it and is POSTed as JSON to the discovered registration
    /// endpoint.
    ///
    /// Never fails: a missing endpoint, a transport error, a non-2xx status
    /// or a body without `client_id` all yield `None`, and the caller must
    /// then supply a client id explicitly.
    pub async fn register(
        &self,
        server_url: &Url,
        metadata: &AuthorizationServerMetadata,
        redirect_uri: &str,
        overrides: Option<&Map<String, Value>>,
    ) -> Option<ClientRegistration> {
        if let Some(cached) = self.store.registration(server_url).await {
            if cached.redirect_uri == redirect_uri {
                debug!(url = %server_url, "Reusing cached client registration");
                return Some(cached);
            }
            debug!(
                url = %server_url,
                cached_redirect = %cached.redirect_uri,
                redirect_uri,
                "Cached registration has a different redirect URI, registering again"
            );
        }

        let Some(endpoint) = metadata.registration_endpoint.as_deref() else {
            debug!(url = %server_url, "No registration endpoint advertised");
            return None;
        };

        let body = registration_body(&self.client_name, redirect_uri, overrides);

        let response = match self.http.post(endpoint).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(endpoint, error = %e, "Dynamic client registration request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(endpoint, %status, body = %text, "Registration endpoint rejected the request");
            return None;
        }

        let dcr: DcrResponse = match response.json().await {
            Ok(d) => d,
            Err(e) => {
                warn!(endpoint, error = %e, "Registration response carried no client_id");
                return None;
            }
        };

        let registration = ClientRegistration {
            client_id: dcr.client_id,
            client_secret: dcr.client_secret,
            redirect_uri: redirect_uri.to_string(),
        };
        info!(url = %server_url, client_id = %registration.client_id, "Registered OAuth client");

        self.store
            .put_registration(server_url, registration.clone())
            .await;
        Some(registration)
    }
}

/// Builds the registration request body.
///
/// Defaults describe a public client using the authorization-code grant
/// with refresh; keys in `overrides` replace the defaults wholesale.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::registration::registration_body;
///
/// let body = registration_body("mcpbridge", "http://localhost:3000/oauth/callback", None);
/// assert_eq!(body["token_endpoint_auth_method"], "none");
/// assert_eq!(body["redirect_uris"][0], "http://localhost:3000/oauth/callback");
/// ```
pub fn registration_body(
    client_name: &str,
    redirect_uri: &str,
    overrides: Option<&Map<String, Value>>,
) -> Value {
    let mut body = json!({
        "client_name": client_name,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    if let (Some(target), Some(extra)) = (body.as_object_mut(), overrides) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }

    body
}
