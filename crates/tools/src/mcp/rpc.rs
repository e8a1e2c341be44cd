use async_trait::async_trait;
use ollama_agent_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        }
    }

    pub fn notification(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcMessage {
    /// Id of a response; requests and notifications from the server yield `None`.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(|v| v.as_u64())
    }

    pub fn into_outcome(self) -> Outcome {
        match self.error {
            Some(err) => Err(RpcFailure::Remote(format!(
                "JSON-RPC error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Pending request table ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RpcFailure {
    /// The server answered with a JSON-RPC error.
    Remote(String),
    /// The channel went away before an answer arrived.
    Closed(String),
}

pub type Outcome = std::result::Result<Value, RpcFailure>;

/// Map an outcome onto the crate error taxonomy.
pub fn settle(server: &str, outcome: Outcome) -> Result<Value> {
    match outcome {
        Ok(value) => Ok(value),
        Err(RpcFailure::Remote(msg)) => Err(Error::Tool(format!("MCP[{}]: {}", server, msg))),
        Err(RpcFailure::Closed(msg)) => Err(transport_error(server, msg)),
    }
}

/// Like [`settle`] for an outcome awaited from the pending table.
pub fn resolve(server: &str, received: std::result::Result<Outcome, oneshot::error::RecvError>) -> Result<Value> {
    match received {
        Ok(outcome) => settle(server, outcome),
        Err(_) => Err(transport_error(server, "connection closed")),
    }
}

type Waiters = HashMap<u64, oneshot::Sender<Outcome>>;

/// Correlates responses read by a background task with waiting callers.
#[derive(Clone, Default)]
pub struct PendingMap {
    inner: Arc<Mutex<Waiters>>,
}

impl PendingMap {
    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter for `id`. The entry lives until the answer
    /// arrives or the returned handle is dropped.
    pub fn register(&self, id: u64) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        PendingRequest {
            id,
            rx,
            map: self.clone(),
        }
    }

    pub fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one inbound line or event payload to its caller.
    pub fn dispatch(&self, server: &str, raw: &str) {
        match serde_json::from_str::<JsonRpcMessage>(raw) {
            Ok(msg) => match msg.response_id() {
                Some(id) => {
                    let waiter = self.lock().remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(msg.into_outcome());
                        }
                        None => debug!(server, id, "MCP: response for unknown request"),
                    }
                }
                None => debug!(server, method = ?msg.method, "MCP: ignoring server message"),
            },
            Err(e) => warn!(server, error = %e, "MCP: failed to parse message"),
        }
    }

    /// Fail every waiting caller.
    pub fn fail_all(&self, reason: &str) {
        let waiters: Vec<_> = self.lock().drain().map(|(_, tx)| tx).collect();
        for tx in waiters {
            let _ = tx.send(Err(RpcFailure::Closed(reason.to_string())));
        }
    }
}

/// One request awaiting its response. Dropping it unanswered, whether by
/// cancellation or an expired deadline, removes its entry from the table.
pub struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    map: PendingMap,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, giving up after `deadline` if one is set.
    pub async fn wait(mut self, server: &str, deadline: Option<Duration>) -> Result<Value> {
        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(transport_error(
                        server,
                        format!("no response within {}s", limit.as_secs_f64()),
                    ))
                }
            },
            None => (&mut self.rx).await,
        };
        resolve(server, received)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.map.forget(self.id);
    }
}

pub fn transport_error(server: &str, message: impl Into<String>) -> Error {
    Error::ProviderTransport {
        name: server.to_string(),
        message: message.into(),
    }
}

/// A bidirectional JSON-RPC channel to one capability provider.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response. Server-side JSON-RPC
    /// errors come back as `Error::Tool`; channel failures as
    /// `Error::ProviderTransport`.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Release the connection. Called at most once.
    async fn close(&self) -> Result<()>;

    fn kind(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::call(7, "tools/list", None);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})
        );
        let note = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(serde_json::to_value(&note).unwrap().get("id").is_none());
    }

    #[tokio::test]
    async fn test_pending_dispatch() {
        let pending = PendingMap::default();
        let req = pending.register(1);
        pending.dispatch("t", r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#);
        pending.dispatch("t", r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#);
        assert_eq!(req.wait("t", None).await.unwrap(), json!({"ok": true}));

        let req = pending.register(2);
        pending.dispatch("t", r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such method"}}"#);
        let err = req.wait("t", None).await.unwrap_err();
        assert!(matches!(err, Error::Tool(ref m) if m.contains("-32601")));

        let req = pending.register(3);
        pending.fail_all("stdout closed");
        assert!(req.wait("t", None).await.unwrap_err().is_transport());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_request_leaves_no_entry() {
        let pending = PendingMap::default();
        let waiting = pending.register(7);
        let task = tokio::spawn(waiting.wait("t", None));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pending.len(), 1);

        task.abort();
        let _ = task.await;
        assert!(pending.is_empty());

        // A late answer for the abandoned id is ignored.
        pending.dispatch("t", r#"{"jsonrpc":"2.0","id":7,"result":{}}"#);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline_forgets_request() {
        let pending = PendingMap::default();
        let err = pending
            .register(9)
            .wait("t", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("no response"));
        assert!(pending.is_empty());
    }
}
