//! Error to HTTP response mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::error::{bridge_error, classify, BridgeError, ErrorKind};

/// Route handler error. Wraps any bridge failure and renders it as JSON.
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    /// Status code and JSON body for this error.
    pub fn parts(&self) -> (StatusCode, Value) {
        let message = self.0.to_string();

        if let Some(bridge) = bridge_error(&self.0) {
            match bridge {
                BridgeError::AuthorizationRequired(required) => {
                    return (
                        StatusCode::UNAUTHORIZED,
                        json!({
                            "error": "authorization_required",
                            "message": message,
                            "server": required.server_name,
                            "authorizationUrl": required.authorization_url,
                            "state": required.state,
                            "expiresIn": required.expires_in,
                        }),
                    )
                }
                BridgeError::Reconnected(server) => {
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({
                            "error": "reconnected",
                            "message": message,
                            "server": server,
                            "retry": true,
                        }),
                    )
                }
                _ => {}
            }
        }

        let (status, code) = match classify(&self.0) {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation_error"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Configuration => (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error"),
            ErrorKind::UpstreamProtocol => (StatusCode::BAD_GATEWAY, "upstream_error"),
            ErrorKind::OAuth => (StatusCode::BAD_GATEWAY, "oauth_error"),
            ErrorKind::Connection => (StatusCode::SERVICE_UNAVAILABLE, "connection_error"),
            ErrorKind::AuthorizationRequired => (StatusCode::UNAUTHORIZED, "authorization_required"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        (status, json!({ "error": code, "message": message }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        if status.is_server_error() && status != StatusCode::INTERNAL_SERVER_ERROR {
            warn!(status = status.as_u16(), error = %self.0, "Upstream failure");
        } else if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?self.0, "Request failed");
        } else {
            debug!(status = status.as_u16(), error = %self.0, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}
