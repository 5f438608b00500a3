//! HTTP transport covering every [`TransportKind`]
//!
//! All three kinds share one duplex mechanism:
//!
//! - Outbound JSON-RPC messages are `POST`ed. The server may answer with
//!   `application/json`, with a `text/event-stream` carrying one or more
//!   messages, or with `202 Accepted` and deliver the reply elsewhere.
//! - For [`TransportKind::Sse`] and [`TransportKind::HttpSse`], [`Transport::open`]
//!   first issues a long-lived `GET` with `Accept: text/event-stream`. If
//!   that stream announces an `endpoint` event, subsequent `POST`s go to the
//!   announced URL (same origin only). Messages pushed on the stream are
//!   delivered through [`Transport::receive`] alongside direct replies.
//! - [`TransportKind::StreamableHttp`] skips the `GET` and posts to the
//!   configured URL directly.
//!
//! Every request carries the configured headers (auth included) and
//! `MCP-Protocol-Version`. An `MCP-Session-Id` returned by the server is
//! echoed on later requests and terminated with `DELETE` on close.
//!
//! A `401` from any request surfaces as [`BridgeError::Unauthorized`]
//! carrying the `WWW-Authenticate` challenge. A lost session, a failed
//! `POST` or an interrupted event stream marks the transport as no longer
//! alive; callers then replace it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::{BridgeError, Result};
use crate::mcp::transport::{Transport, TransportKind};
use crate::mcp::types::LATEST_PROTOCOL_VERSION;

const SESSION_HEADER: &str = "MCP-Session-Id";
const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Longest wait for an `endpoint` event after the event stream opens.
const ENDPOINT_WAIT: Duration = Duration::from_secs(5);

/// Upper bound on the session-terminating `DELETE`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP/SSE transport to one remote server.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use url::Url;
/// use mcpbridge::mcp::transport::TransportKind;
/// use mcpbridge::mcp::transport::http::HttpTransport;
///
/// let transport = HttpTransport::new(
///     reqwest::Client::new(),
///     TransportKind::StreamableHttp,
///     Url::parse("http://localhost:3000/mcp").unwrap(),
///     HashMap::new(),
///     Duration::from_secs(30),
/// );
/// assert_eq!(transport.kind(), TransportKind::StreamableHttp);
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    kind: TransportKind,
    /// Configured server URL; the event stream is opened here.
    endpoint: Url,
    /// Where messages are posted. Starts as `endpoint`.
    post_url: Arc<RwLock<Url>>,
    session_id: Arc<RwLock<Option<String>>>,
    /// Extra headers merged into every request, auth headers included.
    headers: HashMap<String, String>,
    /// Applied to each `POST`; the event stream has no deadline.
    timeout: Duration,
    response_tx: mpsc::UnboundedSender<String>,
    response_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    last_event_id: Arc<RwLock<Option<String>>>,
    alive: Arc<AtomicBool>,
    stream_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Parsers for event-stream replies to individual `POST`s.
    reply_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Creates a transport. No I/O happens until [`Transport::open`].
    ///
    /// # Arguments
    ///
    /// * `http` - Shared client; it must not carry a global timeout, or the
    ///   event stream would be cut off
    /// * `kind` - Transport kind
    /// * `endpoint` - Server URL
    /// * `headers` - Headers added to every request
    /// * `timeout` - Per-`POST` timeout
    pub fn new(
        http: reqwest::Client,
        kind: TransportKind,
        endpoint: Url,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        Self {
            http,
            kind,
            post_url: Arc::new(RwLock::new(endpoint.clone())),
            endpoint,
            session_id: Arc::new(RwLock::new(None)),
            headers,
            timeout,
            response_tx,
            response_rx: Arc::new(Mutex::new(response_rx)),
            last_event_id: Arc::new(RwLock::new(None)),
            alive: Arc::new(AtomicBool::new(true)),
            stream_task: std::sync::Mutex::new(None),
            reply_tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Current `POST` target.
    pub async fn post_url(&self) -> Url {
        self.post_url.read().await.clone()
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn decorate(&self, mut req: RequestBuilder) -> RequestBuilder {
        req = req.header(PROTOCOL_HEADER, LATEST_PROTOCOL_VERSION);
        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, id);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    async fn capture_session(&self, response: &Response) {
        let Some(new_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut sid = self.session_id.write().await;
        if sid.is_none() {
            debug!(url = %self.endpoint, "Session established");
            *sid = Some(new_id.to_string());
        }
    }

    fn set_stream_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut guard) = self.stream_task.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    fn track_reply_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.reply_tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut guard) = self.stream_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        if let Ok(mut tasks) = self.reply_tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }

    fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(url = %self.endpoint, reason, "Transport is no longer usable");
        }
    }

    /// Number of reply parsers still running.
    #[cfg(test)]
    fn live_reply_tasks(&self) -> usize {
        self.reply_tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }

    async fn adopt_endpoint(&self, announced: &str) {
        match self.endpoint.join(announced) {
            Ok(url) if url.origin() == self.endpoint.origin() => {
                debug!(url = %url, "Server announced message endpoint");
                *self.post_url.write().await = url;
            }
            Ok(url) => {
                warn!(url = %url, "Ignoring cross-origin message endpoint");
            }
            Err(e) => {
                warn!(endpoint = announced, error = %e, "Ignoring malformed message endpoint");
            }
        }
    }
}

/// Maps a non-success status onto the bridge error taxonomy.
fn status_error(response: &Response, what: &str) -> Option<BridgeError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        let www_authenticate = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        return Some(BridgeError::Unauthorized { www_authenticate });
    }
    if !status.is_success() {
        return Some(BridgeError::Connection(format!(
            "{what} returned status {status}"
        )));
    }
    None
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self) -> Result<()> {
        if !self.kind.opens_event_stream() {
            return Ok(());
        }

        let mut req = self
            .http
            .get(self.endpoint.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(id) = self.last_event_id.read().await.as_deref() {
            req = req.header(LAST_EVENT_ID_HEADER, id);
        }
        let req = self.decorate(req).await;

        let response = req
            .send()
            .await
            .map_err(|e| BridgeError::Connection(format!("event stream request failed: {e}")))?;

        if let Some(err) = status_error(&response, "event stream") {
            return Err(err.into());
        }
        self.capture_session(&response).await;
        self.alive.store(true, Ordering::SeqCst);

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let byte_stream = response.bytes_stream();
        let response_tx = self.response_tx.clone();
        let last_event_id = Arc::clone(&self.last_event_id);
        let alive = Arc::clone(&self.alive);
        let url = self.endpoint.clone();
        self.set_stream_task(tokio::spawn(async move {
            let clean =
                parse_sse_stream(byte_stream, response_tx, last_event_id, Some(endpoint_tx)).await;
            if !clean && alive.swap(false, Ordering::SeqCst) {
                warn!(url = %url, "Event stream interrupted; transport is no longer usable");
            }
        }));

        match tokio::time::timeout(self.timeout.min(ENDPOINT_WAIT), endpoint_rx).await {
            Ok(Ok(announced)) => self.adopt_endpoint(&announced).await,
            Ok(Err(_)) => {
                debug!(url = %self.endpoint, "Event stream ended without an endpoint event");
            }
            Err(_) => {
                debug!(url = %self.endpoint, "No endpoint event; posting to the stream URL");
            }
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        let url = self.post_url.read().await.clone();
        let req = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(message);
        let req = self.decorate(req).await;

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_dead("POST failed");
                return Err(BridgeError::Connection(format!("HTTP POST failed: {e}")).into());
            }
        };

        let status = response.status();

        if status == StatusCode::NOT_FOUND && self.session_id.read().await.is_some() {
            *self.session_id.write().await = None;
            self.mark_dead("session expired");
            return Err(BridgeError::Connection("session expired".to_string()).into());
        }

        if status == StatusCode::ACCEPTED {
            self.capture_session(&response).await;
            return Ok(());
        }

        if let Some(err) = status_error(&response, "HTTP POST") {
            if matches!(err, BridgeError::Connection(_)) {
                self.mark_dead("POST rejected");
            }
            return Err(err.into());
        }

        self.capture_session(&response).await;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let byte_stream = response.bytes_stream();
            let response_tx = self.response_tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            self.track_reply_task(tokio::spawn(async move {
                parse_sse_stream(byte_stream, response_tx, last_event_id, None).await;
            }));
        } else {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    self.mark_dead("response body unreadable");
                    return Err(BridgeError::Connection(format!(
                        "failed to read response body: {e}"
                    ))
                    .into());
                }
            };
            if !body.trim().is_empty() {
                let _ = self.response_tx.send(body);
            }
        }

        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.response_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.abort_tasks();

        let Some(sid) = self.session_id.write().await.take() else {
            return;
        };

        let url = self.post_url.read().await.clone();
        let mut req = self
            .http
            .delete(url)
            .timeout(CLOSE_TIMEOUT)
            .header(SESSION_HEADER, sid.as_str())
            .header(PROTOCOL_HEADER, LATEST_PROTOCOL_VERSION);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        if let Err(e) = req.send().await {
            debug!(url = %self.endpoint, error = %e, "Session termination failed");
        }
    }
}

impl Drop for HttpTransport {
    /// Aborts the event stream and, when [`Transport::close`] was never
    /// called on an active session, terminates it from a helper thread.
    fn drop(&mut self) {
        self.abort_tasks();

        let session_id = match self.session_id.try_read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        let Some(sid) = session_id else {
            return;
        };

        let endpoint = match self.post_url.try_read() {
            Ok(url) => url.to_string(),
            Err(_) => self.endpoint.to_string(),
        };
        let mut extra_headers = self.headers.clone();
        extra_headers.insert(SESSION_HEADER.to_string(), sid);

        let _ = std::thread::spawn(move || {
            if let Ok(client) = reqwest::blocking::Client::builder()
                .timeout(CLOSE_TIMEOUT)
                .build()
            {
                let mut req = client.delete(&endpoint);
                for (k, v) in &extra_headers {
                    req = req.header(k.as_str(), v.as_str());
                }
                let _ = req.send();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// SSE parser
// ---------------------------------------------------------------------------

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Parses the field lines of one event block.
///
/// # Examples
///
/// ```
/// use mcpbridge::mcp::transport::http::parse_sse_event;
///
/// let event = parse_sse_event("event: endpoint\ndata: /messages?session=1");
/// assert_eq!(event.event.as_deref(), Some("endpoint"));
/// assert_eq!(event.data, "/messages?session=1");
/// ```
pub fn parse_sse_event(block: &str) -> SseEvent {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event = SseEvent::default();

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("id:") {
            event.id = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("event:") {
            event.event = Some(value.trim().to_string());
        }
        // `retry:` and `:` comment lines are ignored.
    }

    event.data = data_lines.join("\n");
    event
}

/// Consumes an SSE byte stream, forwarding message payloads to
/// `response_tx`.
///
/// - `id:` values are stored in `last_event_id`.
/// - `event: ping` and `data: [PING]` are dropped.
/// - The first `event: endpoint` is handed to `endpoint_tx` instead of
///   being forwarded. Dropping `endpoint_tx` at stream end tells the
///   waiter that none arrived.
///
/// Returns `false` when the stream ended with a read error.
pub async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    response_tx: mpsc::UnboundedSender<String>,
    last_event_id: Arc<RwLock<Option<String>>>,
    mut endpoint_tx: Option<oneshot::Sender<String>>,
) -> bool {
    let mut buffer: Vec<u8> = Vec::new();
    let mut clean = true;

    tokio::pin!(byte_stream);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "Event stream interrupted");
                clean = false;
                break;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some((end, separator)) = find_event_boundary(&buffer) {
            let block: Vec<u8> = buffer.drain(..end + separator).collect();
            let event = parse_sse_event(&String::from_utf8_lossy(&block[..end]));
            dispatch_event(event, &response_tx, &last_event_id, &mut endpoint_tx).await;
        }
    }

    if !buffer.is_empty() {
        let event = parse_sse_event(&String::from_utf8_lossy(&buffer));
        dispatch_event(event, &response_tx, &last_event_id, &mut endpoint_tx).await;
    }

    clean
}

/// Position and length of the first blank-line separator.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

async fn dispatch_event(
    event: SseEvent,
    response_tx: &mpsc::UnboundedSender<String>,
    last_event_id: &Arc<RwLock<Option<String>>>,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
) {
    if let Some(id) = &event.id {
        *last_event_id.write().await = Some(id.clone());
    }

    match event.event.as_deref() {
        Some(kind) if kind.eq_ignore_ascii_case("ping") => return,
        Some("endpoint") => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(event.data);
            }
            return;
        }
        _ => {}
    }

    if event.data.is_empty() || event.data.eq_ignore_ascii_case("[ping]") {
        return;
    }

    let _ = response_tx.send(event.data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    fn make_transport(kind: TransportKind, endpoint: &str) -> HttpTransport {
        HttpTransport::new(
            reqwest::Client::new(),
            kind,
            Url::parse(endpoint).unwrap(),
            HashMap::new(),
            Duration::from_secs(5),
        )
    }

    async fn run_parser(body: &'static [u8]) -> (Vec<String>, Option<String>, Option<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let last_event_id = Arc::new(RwLock::new(None::<String>));
        let chunk: reqwest::Result<Bytes> = Ok(Bytes::from_static(body));

        parse_sse_stream(
            futures::stream::iter(vec![chunk]),
            tx,
            Arc::clone(&last_event_id),
            Some(endpoint_tx),
        )
        .await;

        let mut messages = Vec::new();
        while let Ok(m) = rx.try_recv() {
            messages.push(m);
        }
        let endpoint = endpoint_rx.await.ok();
        let id = last_event_id.read().await.clone();
        (messages, endpoint, id)
    }

    #[tokio::test]
    async fn test_receive_initially_empty() {
        let t = make_transport(TransportKind::StreamableHttp, "http://localhost:9/mcp");
        let mut stream = t.receive();
        let result = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_post_url_defaults_to_endpoint() {
        let t = make_transport(TransportKind::Sse, "http://localhost:9/sse");
        assert_eq!(t.post_url().await.as_str(), "http://localhost:9/sse");
        assert!(t.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_streamable_open_is_noop() {
        let t = make_transport(TransportKind::StreamableHttp, "http://localhost:9/mcp");
        assert!(t.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_parser_forwards_messages_in_order() {
        let (messages, _, _) = run_parser(b"data: first\n\ndata: second\n\n").await;
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_parser_handles_crlf_separators() {
        let (messages, _, _) = run_parser(b"data: one\r\n\r\ndata: two\r\n\r\n").await;
        assert_eq!(messages, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_parser_drops_pings() {
        let (messages, _, _) =
            run_parser(b"event: ping\ndata: x\n\ndata: [PING]\n\ndata: real\n\n").await;
        assert_eq!(messages, vec!["real"]);
    }

    #[tokio::test]
    async fn test_parser_routes_endpoint_event() {
        let (messages, endpoint, _) =
            run_parser(b"event: endpoint\ndata: /messages?sessionId=abc\n\ndata: {}\n\n").await;
        assert_eq!(endpoint.as_deref(), Some("/messages?sessionId=abc"));
        assert_eq!(messages, vec!["{}"]);
    }

    #[tokio::test]
    async fn test_parser_without_endpoint_drops_sender() {
        let (_, endpoint, _) = run_parser(b"data: {}\n\n").await;
        assert!(endpoint.is_none());
    }

    #[tokio::test]
    async fn test_parser_stores_last_event_id() {
        let (_, _, id) = run_parser(b"id: evt-42\ndata: payload\n\n").await;
        assert_eq!(id.as_deref(), Some("evt-42"));
    }

    #[tokio::test]
    async fn test_parser_flushes_trailing_event() {
        let (messages, _, _) = run_parser(b"data: tail").await;
        assert_eq!(messages, vec!["tail"]);
    }

    #[test]
    fn test_parse_sse_event_joins_multiline_data() {
        let event = parse_sse_event("data: a\ndata: b\n: comment\nretry: 10");
        assert_eq!(event.data, "a\nb");
        assert!(event.event.is_none());
    }

    #[tokio::test]
    async fn test_failed_post_marks_transport_dead() {
        let t = make_transport(TransportKind::StreamableHttp, "http://127.0.0.1:9/mcp");
        assert!(t.is_alive());
        assert!(t.send("{}".to_string()).await.is_err());
        assert!(!t.is_alive());
    }

    #[tokio::test]
    async fn test_close_aborts_reply_parsers() {
        let t = make_transport(TransportKind::StreamableHttp, "http://localhost:9/mcp");
        let (tx, rx) = oneshot::channel::<()>();
        t.track_reply_task(tokio::spawn(async move {
            let _tx = tx;
            futures::future::pending::<()>().await;
        }));
        assert_eq!(t.live_reply_tasks(), 1);

        t.close().await;

        assert_eq!(t.live_reply_tasks(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_adopt_endpoint_rejects_other_origin() {
        let t = make_transport(TransportKind::Sse, "http://localhost:9/sse");
        t.adopt_endpoint("http://evil.example.com/messages").await;
        assert_eq!(t.post_url().await.as_str(), "http://localhost:9/sse");
        t.adopt_endpoint("/messages?s=1").await;
        assert_eq!(t.post_url().await.as_str(), "http://localhost:9/messages?s=1");
    }
}
