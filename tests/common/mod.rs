//! Shared helpers for integration tests
//!
//! - an OAuth engine whose callback URL is fixed
//! - wiremock mounts for a well-behaved authorization server
//! - `RecordingFactory`, a fake `ConnectionFactory` that records every
//!   connection spec and lets a test reject specific bearer tokens

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpbridge::auth::{EngineSettings, OAuthEngine};
use mcpbridge::config::CallbackSettings;
use mcpbridge::error::{BridgeError, Result};
use mcpbridge::manager::{ManagerSettings, SessionManager};
use mcpbridge::mcp::connection::{ConnectionFactory, ConnectionSpec, McpConnection};
use mcpbridge::mcp::types::{
    CallToolResponse, GetPromptResponse, Implementation, McpTool, Prompt, ReadResourceResponse,
    Resource, ResourceTemplate, ServerCapabilities,
};

pub const CALLBACK_BASE: &str = "https://bridge.example.com";

// ---------------------------------------------------------------------------
// OAuth helpers
// ---------------------------------------------------------------------------

pub fn engine() -> OAuthEngine {
    OAuthEngine::from_settings(
        reqwest::Client::new(),
        None,
        EngineSettings {
            client_name: "mcpbridge-test".to_string(),
            callback: CallbackSettings {
                base_url: Some(CALLBACK_BASE.to_string()),
                ..CallbackSettings::default()
            },
        },
    )
}

pub fn metadata_body(base: &str) -> Value {
    json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "registration_endpoint": format!("{base}/oauth/register"),
        "revocation_endpoint": format!("{base}/oauth/revoke"),
        "code_challenge_methods_supported": ["S256"]
    })
}

pub fn token_body(access: &str, refresh: Option<&str>, expires_in: u64) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": "read"
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}

/// Mounts the metadata document and a registration endpoint issuing
/// `dyn-client`.
pub async fn mount_authorization_server(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body(&server.uri())))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "dyn-client",
            "client_id_issued_at": 0
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Mounts a token endpoint answering `grant_type` with `body`, at most
/// `times` times.
pub async fn mount_token(server: &MockServer, grant_type: &str, body: Value, times: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains(format!("grant_type={grant_type}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(times)
        .mount(server)
        .await;
}

pub async fn requests_to(server: &MockServer, method_name: &str, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.to_string() == method_name && r.url.path() == request_path)
        .count()
}

pub fn state_from(authorization_url: &str) -> String {
    url::Url::parse(authorization_url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Fake connections
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Shared {
    specs: Mutex<Vec<ConnectionSpec>>,
    connects: AtomicUsize,
    connect_failures: AtomicUsize,
    rejected: Mutex<HashSet<String>>,
    connect_delay: Mutex<Option<Duration>>,
}

/// Fake factory recording every connection it builds.
#[derive(Debug, Default, Clone)]
pub struct RecordingFactory {
    shared: Arc<Shared>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations on connections presenting `Bearer {token}` get a 401.
    pub fn reject_token(&self, token: &str) {
        self.shared
            .rejected
            .lock()
            .unwrap()
            .insert(format!("Bearer {token}"));
    }

    /// The next `n` connect attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn specs(&self) -> Vec<ConnectionSpec> {
        self.shared.specs.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn last_header(&self, name: &str) -> Option<String> {
        self.specs()
            .last()
            .and_then(|spec| spec.headers.get(name).cloned())
    }
}

impl ConnectionFactory for RecordingFactory {
    fn create(&self, spec: ConnectionSpec) -> Arc<dyn McpConnection> {
        self.shared.specs.lock().unwrap().push(spec.clone());
        Arc::new(FakeConnection {
            spec,
            open: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        })
    }
}

#[derive(Debug)]
struct FakeConnection {
    spec: ConnectionSpec,
    open: AtomicBool,
    shared: Arc<Shared>,
}

impl FakeConnection {
    fn check(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("not open".into()).into());
        }
        let rejected = self.shared.rejected.lock().unwrap();
        if let Some(auth) = self.spec.headers.get("Authorization") {
            if rejected.contains(auth) {
                return Err(BridgeError::Unauthorized {
                    www_authenticate: "Bearer error=\"invalid_token\"".into(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl McpConnection for FakeConnection {
    async fn connect(&self) -> Result<()> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failures = self.shared.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.shared
                .connect_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(BridgeError::Connection("connection refused".into()).into());
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.check()?;
        Ok(vec![serde_json::from_value(json!({
            "name": "echo",
            "description": "Echo the arguments back",
            "inputSchema": {"type": "object"}
        }))?])
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.check()?;
        Ok(vec![serde_json::from_value(json!({
            "uri": "file:///readme.md",
            "name": "readme",
            "mimeType": "text/markdown"
        }))?])
    }

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        self.check()?;
        Ok(vec![serde_json::from_value(json!({
            "uriTemplate": "file:///{path}",
            "name": "files"
        }))?])
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.check()?;
        Ok(vec![serde_json::from_value(json!({"name": "greet"}))?])
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResponse> {
        self.check()?;
        Ok(serde_json::from_value(json!({
            "content": [{"type": "text", "text": format!("{name}:{}", arguments.unwrap_or(Value::Null))}]
        }))?)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResponse> {
        self.check()?;
        Ok(serde_json::from_value(json!({
            "contents": [{"uri": uri, "mimeType": "text/plain", "text": "hello"}]
        }))?)
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        self.check()?;
        let who = arguments
            .and_then(|a| a.get("who").cloned())
            .unwrap_or_default();
        Ok(serde_json::from_value(json!({
            "description": name,
            "messages": [{"role": "user", "content": {"type": "text", "text": format!("hello {who}")}}]
        }))?)
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        self.is_open().then(|| ServerCapabilities {
            tools: Some(json!({})),
            ..ServerCapabilities::default()
        })
    }

    fn server_info(&self) -> Option<Implementation> {
        self.is_open().then(|| Implementation {
            name: "fake".to_string(),
            version: "1.0.0".to_string(),
            title: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Manager and config helpers
// ---------------------------------------------------------------------------

pub fn manager_with(factory: &RecordingFactory, probe_unauthenticated: bool) -> SessionManager {
    SessionManager::new(
        engine(),
        Arc::new(factory.clone()),
        ManagerSettings {
            probe_unauthenticated,
        },
    )
}

pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
