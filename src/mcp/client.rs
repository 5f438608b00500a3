//! Async JSON-RPC 2.0 client over a [`Transport`]
//!
//! [`JsonRpcClient`] serializes requests, hands them to the transport and
//! matches replies by id. Replies may arrive on the same HTTP exchange or
//! later on the server's event stream; both end up on
//! [`Transport::receive`], which the read loop consumes.
//!
//! - In-flight requests live in a `pending` map keyed by numeric id. Each
//!   entry is a `oneshot::Sender` resolved when the matching reply arrives.
//! - A slot is registered before the request is sent so a fast reply can
//!   never be missed.
//! - Transport errors from `send` (a 401 included) are returned to the
//!   caller unchanged so the session manager can react to them.
//! - Server-initiated `ping` requests are answered. Other server requests get
//!   `-32601 Method not found`. Notifications are logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::mcp::transport::Transport;
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, METHOD_PING};

/// Timeout applied when a server has none configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, JsonRpcError>>>;

/// JSON-RPC client bound to one transport.
pub struct JsonRpcClient {
    /// Server name, used in errors and logs.
    server: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    request_timeout: Duration,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("server", &self.server)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Creates a client. Call [`JsonRpcClient::start_read_loop`] before
    /// issuing requests.
    ///
    /// # Arguments
    ///
    /// * `server` - Server name used in error messages
    /// * `transport` - Opened transport
    /// * `request_timeout` - Deadline for each request
    pub fn new(
        server: impl Into<String>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Sends a request and waits for the typed result.
    ///
    /// # Errors
    ///
    /// - Whatever [`Transport::send`] returns, unchanged
    /// - [`BridgeError::Timeout`] when no reply arrives in time
    /// - [`BridgeError::Connection`] when the read loop stops first
    /// - [`BridgeError::UpstreamProtocol`] for a JSON-RPC error reply
    /// - [`BridgeError::Serialization`] when the result does not match `R`
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let params = match serde_json::to_value(params) {
            Ok(p) => p,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(BridgeError::Serialization(e).into());
            }
        };
        let message = serde_json::to_string(&JsonRpcRequest::new(
            Some(Value::from(id)),
            method,
            Some(params),
        ))?;

        if let Err(e) = self.transport.send(message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(BridgeError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                }
                .into());
            }
        };

        let rpc_result = outcome.map_err(|_| {
            BridgeError::Connection("read loop exited before response arrived".to_string())
        })?;

        let value = rpc_result.map_err(|e| BridgeError::UpstreamProtocol {
            code: Some(e.code),
            message: e.message,
        })?;

        serde_json::from_value(value).map_err(|e| BridgeError::Serialization(e).into())
    }

    /// Sends a notification; no reply is expected.
    ///
    /// # Errors
    ///
    /// Whatever [`Transport::send`] returns.
    pub async fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let message = serde_json::to_string(&JsonRpcRequest::new(
            None,
            method,
            Some(serde_json::to_value(params)?),
        ))?;
        self.transport.send(message).await
    }

    /// Spawns the task that consumes [`Transport::receive`].
    ///
    /// On cancellation or when the inbound stream ends, every pending
    /// sender is dropped so waiting callers fail fast instead of timing out.
    pub fn start_read_loop(
        self: &Arc<Self>,
        cancellation: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let transport = Arc::clone(&client.transport);
            let mut inbound = transport.receive();

            loop {
                tokio::select! {
                    biased;

                    _ = cancellation.cancelled() => break,

                    maybe_msg = inbound.next() => {
                        let Some(raw) = maybe_msg else { break };
                        client.dispatch_message(&raw).await;
                    }
                }
            }

            client.pending.lock().await.clear();
        })
    }

    /// Number of requests still awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn dispatch_message(&self, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(server = %self.server, error = %e, "Ignoring unparseable inbound message");
                return;
            }
        };

        // Batches are flattened; each element is dispatched on its own.
        if let Value::Array(items) = value {
            for item in items {
                self.dispatch_value(item).await;
            }
            return;
        }
        self.dispatch_value(value).await;
    }

    async fn dispatch_value(&self, value: Value) {
        let has_id = value.get("id").is_some_and(|id| !id.is_null());
        let has_method = value.get("method").is_some();
        let is_reply = value.get("result").is_some() || value.get("error").is_some();

        if has_id && is_reply && !has_method {
            self.handle_response(value).await;
        } else if has_id && has_method {
            self.handle_server_request(value).await;
        } else if has_method {
            debug!(
                server = %self.server,
                method = value["method"].as_str().unwrap_or_default(),
                "Server notification"
            );
        } else {
            debug!(server = %self.server, "Ignoring unclassifiable message");
        }
    }

    async fn handle_response(&self, value: Value) {
        let id_val = &value["id"];
        let id = match id_val
            .as_u64()
            .or_else(|| id_val.as_str().and_then(|s| s.parse().ok()))
        {
            Some(id) => id,
            None => {
                warn!(server = %self.server, id = %id_val, "Response has non-integer id");
                return;
            }
        };

        let Some(tx) = self.pending.lock().await.remove(&id) else {
            debug!(server = %self.server, id, "Response for unknown id");
            return;
        };

        let outcome = match value.get("error") {
            Some(error_val) => Err(serde_json::from_value::<JsonRpcError>(error_val.clone())
                .unwrap_or_else(|_| JsonRpcError {
                    code: -32603,
                    message: format!("malformed error object: {error_val}"),
                    data: None,
                })),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };

        // The caller may already have timed out.
        let _ = tx.send(outcome);
    }

    async fn handle_server_request(&self, value: Value) {
        let method = value["method"].as_str().unwrap_or_default().to_string();
        let id = value.get("id").cloned();

        let (result, error) = if method == METHOD_PING {
            (Some(serde_json::json!({})), None)
        } else {
            (
                None,
                Some(JsonRpcError {
                    code: -32601,
                    message: format!("Method not found: {method}"),
                    data: None,
                }),
            )
        };

        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error,
        };

        match serde_json::to_string(&response) {
            Ok(serialized) => {
                if let Err(e) = self.transport.send(serialized).await {
                    debug!(server = %self.server, method = %method, error = %e, "Failed to answer server request");
                }
            }
            Err(e) => warn!(server = %self.server, error = %e, "Failed to serialize reply"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    use futures::Stream;
    use tokio::sync::mpsc;

    use crate::mcp::types::ListToolsResponse;

    /// In-process transport: sent messages are recorded, inbound messages
    /// are injected through `inbound_tx`.
    #[derive(Debug)]
    struct Loopback {
        sent: std::sync::Mutex<Vec<String>>,
        inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
        fail_send: bool,
    }

    #[async_trait::async_trait]
    impl Transport for Loopback {
        async fn open(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, message: String) -> Result<()> {
            if self.fail_send {
                return Err(BridgeError::Unauthorized {
                    www_authenticate: "Bearer".into(),
                }
                .into());
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
            Box::pin(futures::stream::unfold(&self.inbound_rx, |rx| async move {
                let item = rx.lock().await.recv().await?;
                Some((item, rx))
            }))
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn make_client(
        fail_send: bool,
        timeout: Duration,
    ) -> (Arc<JsonRpcClient>, Arc<Loopback>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Loopback {
            sent: std::sync::Mutex::new(Vec::new()),
            inbound_rx: Mutex::new(rx),
            fail_send,
        });
        let client = Arc::new(JsonRpcClient::new(
            "test",
            Arc::clone(&transport) as Arc<dyn Transport>,
            timeout,
        ));
        (client, transport, tx)
    }

    async fn wait_for_sent(transport: &Loopback, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let sent = transport.sent.lock().unwrap().clone();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_reply() {
        let (client, transport, inbound) = make_client(false, Duration::from_secs(2));
        let token = CancellationToken::new();
        client.start_read_loop(token.clone());

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .request::<_, ListToolsResponse>("tools/list", serde_json::json!({}))
                    .await
            })
        };

        let sent = wait_for_sent(&transport, 1).await;
        let request: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(request["method"], "tools/list");
        let id = request["id"].as_u64().unwrap();

        inbound
            .send(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "tools": [{ "name": "echo" }] }
                })
                .to_string(),
            )
            .unwrap();

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.tools[0].name, "echo");
        token.cancel();
    }

    #[tokio::test]
    async fn test_error_reply_becomes_upstream_protocol() {
        let (client, transport, inbound) = make_client(false, Duration::from_secs(2));
        client.start_read_loop(CancellationToken::new());

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request::<_, Value>("tools/call", Value::Null).await })
        };
        let sent = wait_for_sent(&transport, 1).await;
        let id = serde_json::from_str::<Value>(&sent[0]).unwrap()["id"].clone();

        inbound
            .send(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32602, "message": "bad params" }
                })
                .to_string(),
            )
            .unwrap();

        let err = caller.await.unwrap().unwrap_err();
        match crate::error::bridge_error(&err) {
            Some(BridgeError::UpstreamProtocol { code, message }) => {
                assert_eq!(*code, Some(-32602));
                assert_eq!(message, "bad params");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (client, _transport, _inbound) = make_client(false, Duration::from_millis(50));
        client.start_read_loop(CancellationToken::new());

        let err = client
            .request::<_, Value>("tools/list", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::bridge_error(&err),
            Some(BridgeError::Timeout { method, .. }) if method == "tools/list"
        ));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_propagates_unauthorized() {
        let (client, _transport, _inbound) = make_client(true, Duration::from_secs(1));
        let err = client
            .request::<_, Value>("tools/list", Value::Null)
            .await
            .unwrap_err();
        assert!(crate::error::is_unauthorized(&err));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancellation_fails_pending_requests() {
        let (client, transport, _inbound) = make_client(false, Duration::from_secs(5));
        let token = CancellationToken::new();
        let handle = client.start_read_loop(token.clone());

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request::<_, Value>("ping", Value::Null).await })
        };
        wait_for_sent(&transport, 1).await;
        token.cancel();
        handle.await.unwrap();

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(
            crate::error::bridge_error(&err),
            Some(BridgeError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (client, transport, inbound) = make_client(false, Duration::from_secs(1));
        client.start_read_loop(CancellationToken::new());

        inbound
            .send(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#.to_string())
            .unwrap();

        let sent = wait_for_sent(&transport, 1).await;
        let reply: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_unknown_server_request_gets_method_not_found() {
        let (client, transport, inbound) = make_client(false, Duration::from_secs(1));
        client.start_read_loop(CancellationToken::new());

        inbound
            .send(r#"{"jsonrpc":"2.0","id":7,"method":"sampling/createMessage"}"#.to_string())
            .unwrap();

        let sent = wait_for_sent(&transport, 1).await;
        let reply: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_notify_omits_id() {
        let (client, transport, _inbound) = make_client(false, Duration::from_secs(1));
        client
            .notify("notifications/initialized", serde_json::json!({}))
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap().clone();
        let message: Value = serde_json::from_str(&sent[0]).unwrap();
        assert!(message.get("id").is_none());
        assert_eq!(message["method"], "notifications/initialized");
    }
}
