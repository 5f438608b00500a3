//! HTTP API tests
//!
//! Drives the axum router with `tower::ServiceExt::oneshot` over a manager
//! backed by the recording fake factory.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::MockServer;

use common::{manager_with, mount_authorization_server, mount_token, token_body, RecordingFactory};
use mcpbridge::manager::SessionManager;
use mcpbridge::server::router;

fn app() -> (Router, Arc<SessionManager>, RecordingFactory) {
    let factory = RecordingFactory::new();
    let manager = Arc::new(manager_with(&factory, false));
    (router(Arc::clone(&manager)), manager, factory)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, String) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, text) = send(app, method, uri, body).await;
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, name: &str, config: Value) {
    let (status, body) = send_json(
        app,
        Method::POST,
        "/servers",
        Some(json!({"name": name, "config": config})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

// ---------------------------------------------------------------------------
// Registry routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health() {
    let (app, _, _) = app();
    let (status, body) = send_json(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["servers"], 0);
}

#[tokio::test]
async fn test_server_crud() {
    let (app, _, _) = app();
    create(&app, "docs", json!({"url": "https://mcp.example.com/sse"})).await;

    let (status, body) = send_json(&app, Method::GET, "/servers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["servers"][0]["name"], "docs");
    assert_eq!(body["servers"][0]["transport"], "sse");
    assert_eq!(body["servers"][0]["authType"], "none");

    let (status, body) = send_json(
        &app,
        Method::PATCH,
        "/servers/docs",
        Some(json!({"transport": "streamable-http"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transport"], "streamable-http");

    let (status, _) = send(&app, Method::DELETE, "/servers/docs", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send_json(&app, Method::GET, "/servers/docs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_invalid_server_config_is_bad_request() {
    let (app, _, _) = app();
    let (status, body) = send_json(
        &app,
        Method::POST,
        "/servers",
        Some(json!({"name": "bad", "config": {"url": "ftp://example.com"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = send_json(
        &app,
        Method::POST,
        "/servers",
        Some(json!({"name": "bad", "config": {"url": "https://x", "authType": "magic"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_server_is_not_found() {
    let (app, _, _) = app();
    let (status, body) = send_json(&app, Method::GET, "/servers/ghost/tools", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

// ---------------------------------------------------------------------------
// Protocol routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_protocol_routes() {
    let (app, _, factory) = app();
    create(&app, "docs", json!({"url": "https://mcp.example.com/sse"})).await;

    let (status, body) = send_json(&app, Method::POST, "/servers/docs/connect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);
    assert_eq!(body["serverInfo"]["name"], "fake");

    let (_, body) = send_json(&app, Method::GET, "/servers/docs/tools", None).await;
    assert_eq!(body["tools"][0]["name"], "echo");

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/servers/docs/tools/echo",
        Some(json!({"q": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], r#"echo:{"q":"x"}"#);

    let (_, body) = send_json(&app, Method::GET, "/servers/docs/resources", None).await;
    assert_eq!(body["resources"][0]["uri"], "file:///readme.md");

    let (_, body) = send_json(&app, Method::GET, "/servers/docs/resources/templates", None).await;
    assert_eq!(body["resourceTemplates"][0]["uriTemplate"], "file:///{path}");

    let (status, body) = send_json(
        &app,
        Method::GET,
        "/servers/docs/resources/read?uri=file%3A%2F%2F%2Freadme.md",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["contents"][0]["text"], "hello");

    let (_, body) = send_json(&app, Method::GET, "/servers/docs/prompts", None).await;
    assert_eq!(body["prompts"][0]["name"], "greet");

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/servers/docs/prompts/greet",
        Some(json!({"who": "ada"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"][0]["content"]["text"], "hello ada");

    let (status, body) = send_json(&app, Method::POST, "/servers/docs/disconnect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], false);
    assert_eq!(factory.connect_count(), 1);
}

#[tokio::test]
async fn test_read_resource_requires_uri() {
    let (app, _, _) = app();
    create(&app, "docs", json!({"url": "https://mcp.example.com/sse"})).await;
    let (status, body) = send_json(&app, Method::GET, "/servers/docs/resources/read", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_rejected_static_credentials_are_upstream_errors() {
    let (app, _, factory) = app();
    create(
        &app,
        "locked",
        json!({"url": "https://mcp.example.com/sse", "authType": "bearer-token", "bearerToken": "nope"}),
    )
    .await;
    factory.reject_token("nope");

    let (status, body) = send_json(&app, Method::GET, "/servers/locked/tools", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_error");
}

#[tokio::test]
async fn test_connection_failure_is_service_unavailable() {
    let (app, _, factory) = app();
    create(
        &app,
        "down",
        json!({"url": "https://mcp.example.com/sse", "retries": 0}),
    )
    .await;
    factory.fail_next_connects(1);

    let (status, body) = send_json(&app, Method::GET, "/servers/down/tools", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "connection_error");
}

// ---------------------------------------------------------------------------
// OAuth routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_authorization_flow_over_http() {
    let server = MockServer::start().await;
    mount_authorization_server(&server).await;
    mount_token(&server, "authorization_code", token_body("at-1", Some("rt-1"), 3600), 1).await;
    let (app, _, factory) = app();
    create(
        &app,
        "S",
        json!({"url": format!("{}/mcp", server.uri()), "authType": "oauth2"}),
    )
    .await;

    let (status, body) = send_json(&app, Method::GET, "/servers/S/tools", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "authorization_required");
    assert_eq!(body["server"], "S");
    assert_eq!(body["expiresIn"], 600);
    let state = body["state"].as_str().unwrap().to_string();
    assert!(body["authorizationUrl"]
        .as_str()
        .unwrap()
        .contains(&format!("state={state}")));

    let (_, body) = send_json(&app, Method::GET, "/servers/S/oauth/status", None).await;
    assert_eq!(body["requiresAuthorization"], true);

    let callback = format!("/oauth/callback?code=abc&state={state}");
    let (status, page) = send(&app, Method::GET, &callback, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(page.contains("Authorization complete"));
    assert!(page.contains("<strong>S</strong>"));

    let (status, body) = send_json(&app, Method::GET, &callback, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "invalid or expired state");

    let (status, _) = send_json(&app, Method::GET, "/servers/S/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        factory.last_header("Authorization").as_deref(),
        Some("Bearer at-1")
    );

    let (_, body) = send_json(&app, Method::GET, "/servers/S/oauth/status", None).await;
    assert_eq!(body["requiresAuthorization"], false);
    assert_eq!(body["status"]["grantKind"], "authorization_code");

    let (status, _) = send(&app, Method::DELETE, "/servers/S/oauth/tokens", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send_json(&app, Method::GET, "/servers/S/oauth/status", None).await;
    assert_eq!(body["status"]["hasTokens"], false);
}

#[tokio::test]
async fn test_explicit_authorize_route() {
    let server = MockServer::start().await;
    mount_authorization_server(&server).await;
    let (app, _, _) = app();
    create(
        &app,
        "S",
        json!({"url": format!("{}/mcp", server.uri()), "authType": "oauth2"}),
    )
    .await;

    let (status, body) = send_json(
        &app,
        Method::POST,
        "/servers/S/oauth/authorize",
        Some(json!({"callbackUrl": "https://other.example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["serverName"], "S");
    assert!(body["authorizationUrl"]
        .as_str()
        .unwrap()
        .contains("redirect_uri=https%3A%2F%2Fother.example.com%2Foauth%2Fcallback"));
}

#[tokio::test]
async fn test_callback_error_is_reported_and_state_discarded() {
    let server = MockServer::start().await;
    mount_authorization_server(&server).await;
    let (app, manager, _) = app();
    create(
        &app,
        "S",
        json!({"url": format!("{}/mcp", server.uri()), "authType": "oauth2"}),
    )
    .await;
    let (_, body) = send_json(&app, Method::POST, "/servers/S/oauth/authorize", None).await;
    let state = body["state"].as_str().unwrap().to_string();

    let (status, page) = send(
        &app,
        Method::GET,
        &format!("/oauth/callback?error=access_denied&error_description=%3Cb%3Eno%3C%2Fb%3E&state={state}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(page.contains("access_denied"));
    assert!(page.contains("&lt;b&gt;no&lt;/b&gt;"));
    assert!(manager.engine().store().take_pending(&state).await.is_none());
}

#[tokio::test]
async fn test_callback_without_code_is_bad_request() {
    let (app, _, _) = app();
    let (status, body) = send_json(&app, Method::GET, "/oauth/callback?state=x", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_client_credentials_route_requires_matching_strategy() {
    let (app, _, _) = app();
    create(&app, "docs", json!({"url": "https://mcp.example.com/sse"})).await;
    let (status, body) = send_json(
        &app,
        Method::POST,
        "/servers/docs/oauth/client-credentials",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "configuration_error");
}
