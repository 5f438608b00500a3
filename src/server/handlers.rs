//! Route handlers
//!
//! Every handler is a thin adapter: extract, call one [`SessionManager`]
//! operation, wrap the result in JSON. Failures become [`ApiError`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::manager::{FlowOptions, ServerStatus, SessionManager};
use crate::registry::{ServerConfigInput, ServerConfigPatch};

use super::error::ApiError;

type Manager = State<Arc<SessionManager>>;
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of `POST /servers`.
#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub config: ServerConfigInput,
}

#[derive(Debug, Deserialize)]
pub struct ReadResourceQuery {
    pub uri: String,
}

/// Query of `GET /oauth/callback`.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Parses a JSON body; an empty body yields `None`.
fn optional_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| BridgeError::Validation(format!("invalid request body: {e}")).into())
}

fn required_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    optional_body(body)?
        .ok_or_else(|| BridgeError::Validation("request body is required".to_string()).into())
}

async fn registered_status(manager: &SessionManager, name: &str) -> ApiResult<ServerStatus> {
    let status = manager.get_server_status(name).await;
    if !status.registered {
        return Err(BridgeError::ServerNotFound(name.to_string()).into());
    }
    Ok(status)
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

pub async fn health(State(manager): Manager) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "servers": manager.registry().len().await,
    }))
}

pub async fn list_servers(State(manager): Manager) -> Json<Value> {
    Json(json!({ "servers": manager.list_servers().await }))
}

pub async fn create_server(State(manager): Manager, body: Bytes) -> ApiResult<Response> {
    let request: CreateServerRequest = required_body(&body)?;
    manager.register_server(&request.name, request.config).await?;
    let status = manager.get_server_status(&request.name).await;
    Ok((StatusCode::CREATED, Json(status)).into_response())
}

pub async fn get_server(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<ServerStatus>> {
    Ok(Json(registered_status(&manager, &name).await?))
}

pub async fn update_server(
    State(manager): Manager,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ServerStatus>> {
    let patch: ServerConfigPatch = required_body(&body)?;
    manager.update_server(&name, patch).await?;
    Ok(Json(registered_status(&manager, &name).await?))
}

pub async fn delete_server(State(manager): Manager, Path(name): Path<String>) -> ApiResult<StatusCode> {
    manager.remove_server(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn connect(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<ServerStatus>> {
    manager.get_connection(&name).await?;
    Ok(Json(registered_status(&manager, &name).await?))
}

pub async fn disconnect(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<ServerStatus>> {
    manager.disconnect(&name).await?;
    Ok(Json(registered_status(&manager, &name).await?))
}

// ---------------------------------------------------------------------------
// Protocol operations
// ---------------------------------------------------------------------------

pub async fn list_tools(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let tools = manager.list_tools(&name).await?;
    Ok(Json(json!({ "tools": tools })))
}

pub async fn call_tool(
    State(manager): Manager,
    Path((name, tool)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let arguments: Option<Value> = optional_body(&body)?;
    let response = manager.call_tool(&name, &tool, arguments).await?;
    Ok(Json(serde_json::to_value(response)?))
}

pub async fn list_resources(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let resources = manager.list_resources(&name).await?;
    Ok(Json(json!({ "resources": resources })))
}

pub async fn list_resource_templates(
    State(manager): Manager,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let templates = manager.list_resource_templates(&name).await?;
    Ok(Json(json!({ "resourceTemplates": templates })))
}

pub async fn read_resource(
    State(manager): Manager,
    Path(name): Path<String>,
    query: std::result::Result<Query<ReadResourceQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query
        .map_err(|_| BridgeError::Validation("query parameter 'uri' is required".to_string()))?;
    let response = manager.read_resource(&name, &query.uri).await?;
    Ok(Json(serde_json::to_value(response)?))
}

pub async fn list_prompts(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let prompts = manager.list_prompts(&name).await?;
    Ok(Json(json!({ "prompts": prompts })))
}

pub async fn get_prompt(
    State(manager): Manager,
    Path((name, prompt)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let arguments: Option<HashMap<String, String>> = optional_body(&body)?;
    let response = manager.get_prompt(&name, &prompt, arguments).await?;
    Ok(Json(serde_json::to_value(response)?))
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

pub async fn authorize(
    State(manager): Manager,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let options: FlowOptions = optional_body(&body)?.unwrap_or_default();
    let required = manager.initiate_oauth_flow(&name, &options).await?;
    Ok(Json(serde_json::to_value(required)?))
}

pub async fn oauth_status(State(manager): Manager, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let status = manager.get_oauth_status(&name).await?;
    let requires_authorization = manager.requires_oauth_authorization(&name).await?;
    Ok(Json(json!({
        "server": name,
        "requiresAuthorization": requires_authorization,
        "status": status,
    })))
}

pub async fn client_credentials(
    State(manager): Manager,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let status = manager.perform_client_credentials_grant(&name).await?;
    Ok(Json(json!({ "server": name, "status": status })))
}

pub async fn revoke_tokens(State(manager): Manager, Path(name): Path<String>) -> ApiResult<StatusCode> {
    manager.revoke_oauth_tokens(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Redirect target of the authorization server.
pub async fn oauth_callback(
    State(manager): Manager,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Response> {
    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        warn!(error = %error, description = %description, "Authorization server reported an error");
        if let Some(state) = &query.state {
            manager.engine().store().take_pending(state).await;
        }
        let page = page(
            "Authorization failed",
            &format!("{}: {}", escape_html(&error), escape_html(&description)),
        );
        return Ok((StatusCode::BAD_REQUEST, Html(page)).into_response());
    }

    let (Some(code), Some(state)) = (query.code, query.state) else {
        return Err(BridgeError::Validation(
            "callback requires 'code' and 'state' query parameters".to_string(),
        )
        .into());
    };

    let server = manager.complete_oauth_flow(&code, &state).await?;
    info!(server = %server, "Authorization completed");
    let page = page(
        "Authorization complete",
        &format!(
            "Server <strong>{}</strong> is now authorized. You can close this window.",
            escape_html(&server)
        ),
    );
    Ok(Html(page).into_response())
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{body}</p></body></html>"
    )
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
