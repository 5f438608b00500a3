//! In-memory authorization state
//!
//! [`AuthStateStore`] owns every piece of OAuth state the bridge keeps:
//! pending authorizations keyed by their single-use state token, token
//! records keyed by server name, and two caches keyed by server URL
//! (discovered authorization-server metadata and dynamic client
//! registrations).
//!
//! Nothing here is persisted. Expiry is evaluated lazily whenever an entry
//! is consulted; [`AuthStateStore::sweep_expired_pending`] exists only to
//! reclaim memory.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::auth::discovery::AuthorizationServerMetadata;

/// Lifetime of a pending authorization in seconds.
pub const PENDING_AUTHORIZATION_TTL_SECS: i64 = 600;

// ---------------------------------------------------------------------------
// PendingAuthorization
// ---------------------------------------------------------------------------

/// A browser authorization that has been started but not yet completed.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Logical server name the authorization is for.
    pub server_name: String,
    /// Target server URL.
    pub server_url: Url,
    /// PKCE code verifier to present at the token endpoint.
    pub code_verifier: String,
    /// Client id used on the authorization request.
    pub client_id: String,
    /// Client secret for confidential clients.
    pub client_secret: Option<String>,
    /// Scopes requested.
    pub scopes: Vec<String>,
    /// Redirect URI sent on the authorization request; the token exchange
    /// must repeat it verbatim.
    pub redirect_uri: String,
    /// Explicit metadata URL configured for the server, if any.
    pub metadata_url: Option<String>,
    /// When the authorization was initiated.
    pub created_at: DateTime<Utc>,
    /// `created_at` + [`PENDING_AUTHORIZATION_TTL_SECS`].
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    /// Returns `true` once `now` has reached the absolute expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole seconds of validity left at `now` (never negative).
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

// ---------------------------------------------------------------------------
// TokenRecord
// ---------------------------------------------------------------------------

/// How a token record was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// Interactive authorization-code grant with PKCE.
    AuthorizationCode,
    /// Server-to-server client-credentials grant.
    ClientCredentials,
}

/// Tokens held for one server name.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    /// Opaque access token.
    pub access_token: String,
    /// Refresh token, when the authorization server issued one.
    pub refresh_token: Option<String>,
    /// Token type, normally `Bearer`.
    pub token_type: String,
    /// Space-separated granted scope.
    pub scope: Option<String>,
    /// URL of the server the tokens were issued for.
    pub server_url: Url,
    /// Client id used to obtain the tokens (kept for silent refresh).
    pub client_id: String,
    /// Client secret used to obtain the tokens, if any.
    pub client_secret: Option<String>,
    /// Explicit metadata URL configured for the server, if any.
    pub metadata_url: Option<String>,
    /// Grant that produced the record.
    pub grant_kind: GrantKind,
    /// When the tokens were issued.
    pub issued_at: DateTime<Utc>,
    /// Absolute expiry; `None` means the lifetime is unknown.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Returns `true` when the record has a finite expiry that has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Returns `true` when the record expires within `window` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp - window)
    }

    /// An expired record without a refresh token can never be used again.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !(self.is_expired_at(now) && self.refresh_token.is_none())
    }
}

// ---------------------------------------------------------------------------
// ClientRegistration
// ---------------------------------------------------------------------------

/// Result of dynamic client registration for one server URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    /// Issued client id.
    pub client_id: String,
    /// Issued client secret, for confidential registrations.
    pub client_secret: Option<String>,
    /// Redirect URI the client was registered with.
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
struct CachedMetadata {
    metadata: AuthorizationServerMetadata,
    fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AuthStateStore
// ---------------------------------------------------------------------------

/// Process-local authorization state.
///
/// Each map is guarded by its own lock so that token lookups never wait on
/// discovery bookkeeping.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::store::AuthStateStore;
///
/// # #[tokio::main]
/// # async fn main() {
/// let store = AuthStateStore::new(None);
/// assert!(store.tokens("github").await.is_none());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct AuthStateStore {
    pending: RwLock<HashMap<String, PendingAuthorization>>,
    tokens: RwLock<HashMap<String, TokenRecord>>,
    metadata: RwLock<HashMap<String, CachedMetadata>>,
    registrations: RwLock<HashMap<String, ClientRegistration>>,
    metadata_ttl: Option<Duration>,
}

impl AuthStateStore {
    /// Creates an empty store.
    ///
    /// # Arguments
    ///
    /// * `metadata_ttl` - How long discovered metadata stays fresh. `None`
    ///   keeps it for the life of the process.
    pub fn new(metadata_ttl: Option<Duration>) -> Self {
        Self {
            metadata_ttl,
            ..Self::default()
        }
    }

    /// Configured metadata lifetime.
    pub fn metadata_ttl(&self) -> Option<Duration> {
        self.metadata_ttl
    }

    // -- pending authorizations ---------------------------------------------

    /// Stores a pending authorization under its state token.
    ///
    /// Returns `false` (and leaves the existing entry alone) when a live
    /// entry already holds that state.
    pub async fn insert_pending(&self, state: String, pending: PendingAuthorization) -> bool {
        let mut map = self.pending.write().await;
        if let Some(existing) = map.get(&state) {
            if !existing.is_expired_at(Utc::now()) {
                return false;
            }
        }
        map.insert(state, pending);
        true
    }

    /// Removes and returns the pending authorization for `state`.
    pub async fn take_pending(&self, state: &str) -> Option<PendingAuthorization> {
        self.pending.write().await.remove(state)
    }

    /// Returns `true` when a pending authorization exists for `state`.
    #[cfg(test)]
    pub async fn has_pending(&self, state: &str) -> bool {
        self.pending.read().await.contains_key(state)
    }

    /// Drops every pending authorization whose expiry has passed.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep_expired_pending(&self) -> usize {
        let now = Utc::now();
        let mut map = self.pending.write().await;
        let before = map.len();
        map.retain(|_, p| !p.is_expired_at(now));
        before - map.len()
    }

    // -- tokens --------------------------------------------------------------

    /// Replaces the token record for `server_name`.
    pub async fn put_tokens(&self, server_name: &str, record: TokenRecord) {
        self.tokens
            .write()
            .await
            .insert(server_name.to_string(), record);
    }

    /// Returns a copy of the token record for `server_name`.
    pub async fn tokens(&self, server_name: &str) -> Option<TokenRecord> {
        self.tokens.read().await.get(server_name).cloned()
    }

    /// Deletes and returns the token record for `server_name`.
    pub async fn remove_tokens(&self, server_name: &str) -> Option<TokenRecord> {
        self.tokens.write().await.remove(server_name)
    }

    // -- metadata cache ------------------------------------------------------

    /// Caches discovered metadata for a server URL.
    pub async fn put_metadata(&self, server_url: &Url, metadata: AuthorizationServerMetadata) {
        self.metadata.write().await.insert(
            server_url.as_str().to_string(),
            CachedMetadata {
                metadata,
                fetched_at: Utc::now(),
            },
        );
    }

    /// Returns cached metadata that is still within the configured TTL.
    pub async fn metadata(&self, server_url: &Url) -> Option<AuthorizationServerMetadata> {
        let map = self.metadata.read().await;
        let cached = map.get(server_url.as_str())?;
        if let Some(ttl) = self.metadata_ttl {
            if Utc::now() - cached.fetched_at >= ttl {
                return None;
            }
        }
        Some(cached.metadata.clone())
    }

    /// Forgets cached metadata for a server URL.
    pub async fn invalidate_metadata(&self, server_url: &Url) {
        self.metadata.write().await.remove(server_url.as_str());
    }

    // -- registrations -------------------------------------------------------

    /// Caches a dynamic client registration for a server URL.
    pub async fn put_registration(&self, server_url: &Url, registration: ClientRegistration) {
        self.registrations
            .write()
            .await
            .insert(server_url.as_str().to_string(), registration);
    }

    /// Returns the cached registration for a server URL.
    pub async fn registration(&self, server_url: &Url) -> Option<ClientRegistration> {
        self.registrations
            .read()
            .await
            .get(server_url.as_str())
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
