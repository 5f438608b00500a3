//! Error types for mcpbridge
//!
//! This module defines the closed set of failures the bridge can produce,
//! using `thiserror` for the enum and `anyhow` for propagation. Callers at
//! the route boundary classify an `anyhow::Error` with [`classify`] and map
//! the resulting [`ErrorKind`] onto an HTTP status.

use serde::Serialize;
use thiserror::Error;

/// Payload carried by [`BridgeError::AuthorizationRequired`].
///
/// Everything a caller needs to send the user through the browser flow:
/// the ready-to-open authorization URL, the state token that the callback
/// will carry, and the number of seconds the pending authorization remains
/// valid.
///
/// # Examples
///
/// ```
/// use mcpbridge::error::AuthorizationRequired;
///
/// let required = AuthorizationRequired {
///     server_name: "github".to_string(),
///     authorization_url: "https://auth.example.com/authorize?state=abc".to_string(),
///     state: "abc".to_string(),
///     expires_in: 600,
/// };
/// assert_eq!(required.expires_in, 600);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequired {
    /// Logical name of the server that needs authorization.
    pub server_name: String,
    /// Fully built authorization endpoint URL including PKCE parameters.
    pub authorization_url: String,
    /// Single-use state token bound to the pending authorization.
    pub state: String,
    /// Remaining validity of the pending authorization in seconds.
    pub expires_in: i64,
}

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Interactive authorization is needed before a connection can be made
    #[error("Authorization required for server '{}'", .0.server_name)]
    AuthorizationRequired(AuthorizationRequired),

    /// Transport could not be established or is not currently open
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote server returned a protocol-level error
    #[error("Upstream protocol error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    UpstreamProtocol {
        /// JSON-RPC error code reported by the remote server, when present
        code: Option<i64>,
        /// Remote error message
        message: String,
    },

    /// Caller-supplied input rejected before any network activity
    #[error("Validation error: {0}")]
    Validation(String),

    /// A registered server's configuration cannot support the operation
    #[error("Configuration error: {0}")]
    Config(String),

    /// No server is registered under the given name
    #[error("Server not registered: {0}")]
    ServerNotFound(String),

    /// No pending authorization matches the supplied state
    #[error("invalid or expired state")]
    InvalidState,

    /// The pending authorization was found but is past its expiry
    #[error("authorization request has expired")]
    AuthorizationExpired,

    /// Token endpoint, registration or refresh failure
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Remote server answered 401 Unauthorized
    #[error("Unauthorized by remote server")]
    Unauthorized {
        /// Raw `WWW-Authenticate` header value (empty when absent)
        www_authenticate: String,
    },

    /// Connectivity was restored after an authorization failure; the
    /// in-flight operation was not replayed and must be re-issued
    #[error("Session for server '{0}' was re-established; retry the request")]
    Reconnected(String),

    /// No response arrived within the configured timeout
    #[error("Timeout waiting for '{method}' from server '{server}'")]
    Timeout {
        /// Server name (or endpoint) the request was sent to
        server: String,
        /// JSON-RPC method that timed out
        method: String,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Closed classification of [`BridgeError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Interactive authorization needed
    AuthorizationRequired,
    /// Local connection failure, nothing was mutated remotely
    Connection,
    /// Remote server error on an established session
    UpstreamProtocol,
    /// Bad caller input
    Validation,
    /// Server configuration cannot support the request
    Configuration,
    /// Unknown server name
    NotFound,
    /// Authorization server failure
    OAuth,
    /// Everything else
    Internal,
}

impl BridgeError {
    /// Returns the taxonomy bucket for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcpbridge::error::{BridgeError, ErrorKind};
    ///
    /// assert_eq!(BridgeError::InvalidState.kind(), ErrorKind::Validation);
    /// assert_eq!(
    ///     BridgeError::ServerNotFound("x".into()).kind(),
    ///     ErrorKind::NotFound
    /// );
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::AuthorizationRequired(_) => ErrorKind::AuthorizationRequired,
            BridgeError::Connection(_)
            | BridgeError::Timeout { .. }
            | BridgeError::Reconnected(_)
            | BridgeError::Http(_) => ErrorKind::Connection,
            BridgeError::UpstreamProtocol { .. } | BridgeError::Unauthorized { .. } => {
                ErrorKind::UpstreamProtocol
            }
            BridgeError::Validation(_)
            | BridgeError::InvalidState
            | BridgeError::AuthorizationExpired => ErrorKind::Validation,
            BridgeError::Config(_) => ErrorKind::Configuration,
            BridgeError::ServerNotFound(_) => ErrorKind::NotFound,
            BridgeError::OAuth(_) => ErrorKind::OAuth,
            BridgeError::Io(_) | BridgeError::Serialization(_) | BridgeError::Yaml(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Result type alias for bridge operations
///
/// Uses `anyhow::Error` so that context can be attached freely while the
/// underlying [`BridgeError`] stays recoverable via `downcast_ref`.
pub type Result<T> = anyhow::Result<T>;

/// Finds the first [`BridgeError`] in an error chain.
pub fn bridge_error(err: &anyhow::Error) -> Option<&BridgeError> {
    err.chain().find_map(|e| e.downcast_ref::<BridgeError>())
}

/// Classifies an arbitrary error, defaulting to [`ErrorKind::Internal`].
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    bridge_error(err)
        .map(BridgeError::kind)
        .unwrap_or(ErrorKind::Internal)
}

/// Returns `true` when the error chain carries a remote 401.
pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    matches!(bridge_error(err), Some(BridgeError::Unauthorized { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_invalid_state_display() {
        assert_eq!(
            BridgeError::InvalidState.to_string(),
            "invalid or expired state"
        );
    }

    #[test]
    fn test_authorization_expired_display() {
        assert_eq!(
            BridgeError::AuthorizationExpired.to_string(),
            "authorization request has expired"
        );
    }

    #[test]
    fn test_upstream_protocol_display_with_code() {
        let error = BridgeError::UpstreamProtocol {
            code: Some(-32601),
            message: "Method not found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Upstream protocol error -32601: Method not found"
        );
    }

    #[test]
    fn test_upstream_protocol_display_without_code() {
        let error = BridgeError::UpstreamProtocol {
            code: None,
            message: "boom".to_string(),
        };
        assert_eq!(error.to_string(), "Upstream protocol error: boom");
    }

    #[test]
    fn test_authorization_required_display_names_server() {
        let error = BridgeError::AuthorizationRequired(AuthorizationRequired {
            server_name: "linear".to_string(),
            authorization_url: "https://a/authorize".to_string(),
            state: "s".to_string(),
            expires_in: 600,
        });
        assert!(error.to_string().contains("linear"));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            BridgeError::Connection("x".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            BridgeError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            BridgeError::Config("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(BridgeError::OAuth("x".into()).kind(), ErrorKind::OAuth);
        assert_eq!(
            BridgeError::AuthorizationExpired.kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_classify_finds_error_under_context() {
        let err: anyhow::Error = BridgeError::ServerNotFound("s".into()).into();
        let wrapped = Err::<(), _>(err).context("while connecting").unwrap_err();
        assert_eq!(classify(&wrapped), ErrorKind::NotFound);
    }

    #[test]
    fn test_classify_foreign_error_is_internal() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(classify(&err), ErrorKind::Internal);
    }

    #[test]
    fn test_is_unauthorized() {
        let err: anyhow::Error = BridgeError::Unauthorized {
            www_authenticate: "Bearer".into(),
        }
        .into();
        assert!(is_unauthorized(&err));
        let other: anyhow::Error = BridgeError::Connection("x".into()).into();
        assert!(!is_unauthorized(&other));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let error: BridgeError = json_error.into();
        assert!(matches!(error, BridgeError::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeError>();
    }
}
