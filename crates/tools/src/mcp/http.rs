use async_trait::async_trait;
use futures::StreamExt;
use ollama_agent_core::sse::SseParser;
use ollama_agent_core::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rpc::{
    settle, transport_error, JsonRpcMessage, JsonRpcRequest, McpTransport, Outcome, PendingMap,
};

const SESSION_HEADER: &str = "mcp-session-id";

fn build_client(server: &str, headers: &HashMap<String, String>, timeout: Option<Duration>) -> Result<Client> {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| Error::Config(format!("MCP[{}]: invalid header name '{}': {}", server, k, e)))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| Error::Config(format!("MCP[{}]: invalid header value for '{}': {}", server, k, e)))?;
        map.insert(name, value);
    }
    let mut builder = Client::builder().default_headers(map).connect_timeout(Duration::from_secs(10));
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("MCP[{}]: failed to build HTTP client: {}", server, e)))
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

/// JSON-RPC over HTTP POST; each response is either a JSON body or an
/// event-stream carrying the reply.
pub struct HttpStreamTransport {
    server_name: String,
    url: Url,
    client: Client,
    next_id: AtomicU64,
    session_id: StdMutex<Option<String>>,
}

impl HttpStreamTransport {
    pub fn new(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("MCP[{}]: invalid url '{}': {}", server_name, url, e)))?;
        Ok(Self {
            server_name: server_name.to_string(),
            url,
            client: build_client(server_name, headers, Some(Duration::from_secs(timeout_secs.max(1))))?,
            next_id: AtomicU64::new(1),
            session_id: StdMutex::new(None),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    async fn post(&self, body: &JsonRpcRequest<'_>) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(sid) = self.session_id() {
            req = req.header(SESSION_HEADER, sid);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("request failed: {}", e)))?;

        if let Some(sid) = resp.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            if let Ok(mut slot) = self.session_id.lock() {
                if slot.as_deref() != Some(sid) {
                    debug!(server = %self.server_name, session = sid, "MCP session established");
                    *slot = Some(sid.to_string());
                }
            }
        }

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(transport_error(
                &self.server_name,
                format!("HTTP {}: {}", status, crate::safe_truncate(&text, 200)),
            ));
        }
        Ok(resp)
    }

    async fn read_event_stream(&self, resp: reqwest::Response, id: u64) -> Result<Value> {
        let mut parser = SseParser::new();
        let mut body = resp.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| transport_error(&self.server_name, format!("stream error: {}", e)))?;
            for frame in parser.feed(&chunk) {
                if let Some(outcome) = self.match_response(&frame.data, id) {
                    return settle(&self.server_name, outcome);
                }
            }
        }
        if let Some(frame) = parser.finish() {
            if let Some(outcome) = self.match_response(&frame.data, id) {
                return settle(&self.server_name, outcome);
            }
        }
        Err(transport_error(&self.server_name, "event stream ended without a response"))
    }

    fn match_response(&self, data: &str, id: u64) -> Option<Outcome> {
        if data.is_empty() {
            return None;
        }
        match serde_json::from_str::<JsonRpcMessage>(data) {
            Ok(msg) if msg.response_id() == Some(id) => Some(msg.into_outcome()),
            Ok(_) => None,
            Err(e) => {
                warn!(server = %self.server_name, error = %e, "MCP: failed to parse event data");
                None
            }
        }
    }
}

#[async_trait]
impl McpTransport for HttpStreamTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(server = %self.server_name, id, method, "MCP → request");
        let resp = self.post(&JsonRpcRequest::call(id, method, params)).await?;

        let is_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_stream {
            return self.read_event_stream(resp, id).await;
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("invalid JSON response: {}", e)))?;
        let messages = match body {
            Value::Array(items) => items,
            single => vec![single],
        };
        for raw in messages {
            let msg: JsonRpcMessage = serde_json::from_value(raw)?;
            if msg.response_id() == Some(id) {
                return settle(&self.server_name, msg.into_outcome());
            }
        }
        Err(transport_error(&self.server_name, format!("no response for request {}", id)))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.post(&JsonRpcRequest::notification(method, params)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(sid) = self.session_id() else {
            return Ok(());
        };
        let resp = self
            .client
            .delete(self.url.clone())
            .header(SESSION_HEADER, sid)
            .send()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("session delete failed: {}", e)))?;
        // Servers may refuse client-initiated termination.
        if !resp.status().is_success() && resp.status() != StatusCode::METHOD_NOT_ALLOWED {
            warn!(server = %self.server_name, status = %resp.status(), "MCP session delete rejected");
        }
        info!(server = %self.server_name, "Closed MCP HTTP session");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http_stream"
    }
}

// ─── Legacy SSE ──────────────────────────────────────────────────────────────

/// GET event stream for responses plus POST endpoint for requests.
pub struct SseTransport {
    server_name: String,
    client: Client,
    endpoint: Url,
    next_id: AtomicU64,
    pending: PendingMap,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| Error::Config(format!("MCP[{}]: invalid url '{}': {}", server_name, url, e)))?;
        // No overall timeout: the stream stays open for the provider's lifetime.
        let client = build_client(server_name, headers, None)?;

        let resp = tokio::time::timeout(
            Duration::from_secs(timeout_secs.max(1)),
            client.get(base.clone()).header(ACCEPT, "text/event-stream").send(),
        )
        .await
        .map_err(|_| transport_error(server_name, "timed out opening event stream"))?
        .map_err(|e| transport_error(server_name, format!("event stream failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(transport_error(server_name, format!("event stream HTTP {}", resp.status())));
        }

        let pending = PendingMap::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let reader = tokio::spawn(Self::reader_task(
            resp,
            pending.clone(),
            closed.clone(),
            endpoint_tx,
            server_name.to_string(),
        ));

        let raw_endpoint = match tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), endpoint_rx).await {
            Ok(Ok(e)) => e,
            Ok(Err(_)) => {
                reader.abort();
                return Err(transport_error(server_name, "event stream closed before endpoint event"));
            }
            Err(_) => {
                reader.abort();
                return Err(transport_error(server_name, "timed out waiting for endpoint event"));
            }
        };
        let endpoint = base
            .join(raw_endpoint.trim())
            .map_err(|e| transport_error(server_name, format!("invalid endpoint '{}': {}", raw_endpoint, e)))?;
        info!(server = %server_name, endpoint = %endpoint, "MCP SSE endpoint received");

        Ok(Self {
            server_name: server_name.to_string(),
            client,
            endpoint,
            next_id: AtomicU64::new(1),
            pending,
            reader: StdMutex::new(Some(reader)),
            closed,
            request_timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }

    async fn reader_task(
        resp: reqwest::Response,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
        endpoint_tx: oneshot::Sender<String>,
        server_name: String,
    ) {
        let mut endpoint_tx = Some(endpoint_tx);
        let mut parser = SseParser::new();
        let mut body = resp.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    warn!(server = %server_name, error = %e, "MCP SSE stream error");
                    break;
                }
            };
            for frame in parser.feed(&chunk) {
                match frame.event_type() {
                    "endpoint" => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(frame.data);
                        }
                    }
                    "message" => pending.dispatch(&server_name, &frame.data),
                    other => debug!(server = %server_name, event = other, "MCP SSE: ignoring event"),
                }
            }
        }
        debug!(server = %server_name, "MCP SSE stream ended");
        closed.store(true, Ordering::SeqCst);
        pending.fail_all("MCP event stream closed");
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(transport_error(&self.server_name, "event stream closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let waiting = self.pending.register(id);
        debug!(server = %self.server_name, id, method, "MCP → request");

        let sent = self
            .client
            .post(self.endpoint.clone())
            .json(&JsonRpcRequest::call(id, method, params))
            .send()
            .await;
        match sent {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                return Err(transport_error(&self.server_name, format!("HTTP {}", resp.status())));
            }
            Err(e) => {
                return Err(transport_error(&self.server_name, format!("request failed: {}", e)));
            }
        }
        waiting.wait(&self.server_name, Some(self.request_timeout)).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&JsonRpcRequest::notification(method, params))
            .send()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(transport_error(&self.server_name, format!("HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = reader {
            handle.abort();
        }
        self.pending.fail_all("MCP event stream closed");
        info!(server = %self.server_name, "Closed MCP SSE stream");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::sse::{Event, Sse};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::convert::Infallible;
    use tokio::sync::mpsc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[derive(Clone, Default)]
    struct StreamState {
        deleted: Arc<AtomicBool>,
    }

    async fn stream_rpc(headers: AxumHeaders, Json(body): Json<Value>) -> Response {
        let id = body.get("id").cloned();
        match body["method"].as_str().unwrap_or_default() {
            "initialize" => (
                [("mcp-session-id", "sess-42")],
                Json(json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": "2024-11-05"}})),
            )
                .into_response(),
            "tools/list" => {
                if headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) != Some("sess-42") {
                    return AxumStatus::BAD_REQUEST.into_response();
                }
                let payload = json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [{"name": "search", "inputSchema": {}}]}});
                (
                    [("content-type", "text/event-stream")],
                    format!("event: message\ndata: {}\n\n", payload),
                )
                    .into_response()
            }
            "tools/call" => Json(json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32602, "message": "bad arguments"}
            }))
            .into_response(),
            _ => AxumStatus::ACCEPTED.into_response(),
        }
    }

    async fn stream_delete(State(state): State<StreamState>) -> AxumStatus {
        state.deleted.store(true, Ordering::SeqCst);
        AxumStatus::OK
    }

    #[tokio::test]
    async fn test_http_stream_json_and_event_stream_replies() {
        let state = StreamState::default();
        let app = Router::new()
            .route("/mcp", post(stream_rpc).delete(stream_delete))
            .with_state(state.clone());
        let base = serve(app).await;

        let t = HttpStreamTransport::new("remote", &format!("{}/mcp", base), &HashMap::new(), 5).unwrap();
        let init = t.request("initialize", Some(json!({}))).await.unwrap();
        assert_eq!(init["protocolVersion"], "2024-11-05");
        t.notify("notifications/initialized", None).await.unwrap();

        let tools = t.request("tools/list", None).await.unwrap();
        assert_eq!(tools["tools"][0]["name"], "search");

        let err = t.request("tools/call", Some(json!({"name": "x"}))).await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));

        t.close().await.unwrap();
        assert!(state.deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_http_stream_unreachable_is_transport_error() {
        let t = HttpStreamTransport::new("down", "http://127.0.0.1:9/mcp", &HashMap::new(), 2).unwrap();
        let err = t.request("initialize", None).await.unwrap_err();
        assert!(err.is_transport());
    }

    type EventTx = Arc<tokio::sync::Mutex<Option<mpsc::UnboundedSender<Event>>>>;

    async fn sse_open(State(tx_slot): State<EventTx>) -> impl IntoResponse {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let _ = tx.send(Event::default().event("endpoint").data("/messages?session=1"));
        *tx_slot.lock().await = Some(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ev| (Ok::<_, Infallible>(ev), rx))
        });
        Sse::new(stream)
    }

    async fn sse_post(State(tx_slot): State<EventTx>, Json(body): Json<Value>) -> AxumStatus {
        if let Some(id) = body.get("id").cloned() {
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"echo": body["method"]}});
            if let Some(tx) = tx_slot.lock().await.as_ref() {
                let _ = tx.send(Event::default().event("message").data(reply.to_string()));
            }
        }
        AxumStatus::ACCEPTED
    }

    #[tokio::test]
    async fn test_sse_endpoint_handshake_and_routing() {
        let slot: EventTx = Arc::default();
        let app = Router::new()
            .route("/sse", get(sse_open))
            .route("/messages", post(sse_post))
            .with_state(slot);
        let base = serve(app).await;

        let t = SseTransport::connect("events", &format!("{}/sse", base), &HashMap::new(), 5)
            .await
            .unwrap();
        assert_eq!(t.endpoint.path(), "/messages");

        let first = t.request("initialize", None).await.unwrap();
        let second = t.request("tools/list", None).await.unwrap();
        assert_eq!(first["echo"], "initialize");
        assert_eq!(second["echo"], "tools/list");

        t.close().await.unwrap();
        let err = t.request("tools/list", None).await.unwrap_err();
        assert!(err.is_transport());
    }

    async fn sse_post_silent(State(_slot): State<EventTx>, Json(_body): Json<Value>) -> AxumStatus {
        AxumStatus::ACCEPTED
    }

    #[tokio::test]
    async fn test_sse_unanswered_request_times_out_and_is_forgotten() {
        let slot: EventTx = Arc::default();
        let app = Router::new()
            .route("/sse", get(sse_open))
            .route("/messages", post(sse_post_silent))
            .with_state(slot);
        let base = serve(app).await;

        let t = SseTransport::connect("quiet", &format!("{}/sse", base), &HashMap::new(), 1)
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let err = t.request("tools/list", None).await.unwrap_err();
        assert!(err.is_transport());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(t.pending.is_empty());
        t.close().await.unwrap();
    }
}
