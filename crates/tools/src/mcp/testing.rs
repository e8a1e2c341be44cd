//! In-process stand-ins for capability providers.

use async_trait::async_trait;
use ollama_agent_core::{Error, ProviderDescriptor, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::manager::ProviderConnector;
use super::rpc::{transport_error, McpTransport};

/// Answers `initialize`, `tools/list` and `tools/call` from memory.
///
/// `tools/call` on a tool named `fail` returns an `isError` result; any
/// other tool echoes `contents of <path>`.
pub struct ScriptedTransport {
    tools: Vec<String>,
    log: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            tools: vec!["read_file".to_string()],
            log: Arc::default(),
            closes: Arc::default(),
            broken: Arc::default(),
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    pub fn closes(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }

    /// Once set, every request fails at the transport level.
    pub fn broken_flag(&self) -> Arc<AtomicBool> {
        self.broken.clone()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if let Ok(mut log) = self.log.lock() {
            log.push(method.to_string());
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(transport_error("scripted", "connection reset"));
        }
        let params = params.unwrap_or(Value::Null);
        match method {
            "initialize" => Ok(json!({"protocolVersion": "2024-11-05", "capabilities": {}})),
            "tools/list" => Ok(json!({
                "tools": self.tools.iter().map(|name| json!({
                    "name": name,
                    "description": format!("{} tool", name),
                    "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
                })).collect::<Vec<_>>()
            })),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                if name == "fail" {
                    return Ok(json!({"content": [{"type": "text", "text": "file not found"}], "isError": true}));
                }
                let path = params["arguments"]["path"].as_str().unwrap_or("?");
                Ok(json!({"content": [{"type": "text", "text": format!("contents of {}", path)}]}))
            }
            other => Err(Error::Tool(format!("unsupported method {}", other))),
        }
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<()> {
        if let Ok(mut log) = self.log.lock() {
            log.push(method.to_string());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

/// Connector producing [`ScriptedTransport`]s, with failure and latency
/// injection.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    attempts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
    fail_first: usize,
    delay: Duration,
    list_delay: Duration,
    tools: Vec<String>,
    close_fails: bool,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` connection attempts.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_first(usize::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Delay every `tools/list` answer.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Teardown reports an error (after being counted).
    pub fn with_failing_close(mut self) -> Self {
        self.close_fails = true;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Break every transport created so far and later.
    pub fn break_transports(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn repair_transports(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

struct CountingTransport {
    inner: ScriptedTransport,
    close_fails: bool,
    list_delay: Duration,
}

#[async_trait]
impl McpTransport for CountingTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if method == "tools/list" && !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        self.inner.request(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.notify(method, params).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        if self.close_fails {
            return Err(transport_error("scripted", "close failed"));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

#[async_trait]
impl ProviderConnector for ScriptedConnector {
    async fn connect(&self, descriptor: &ProviderDescriptor) -> Result<Box<dyn McpTransport>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt <= self.fail_first {
            return Err(Error::ProviderStartup {
                name: descriptor.name.clone(),
                message: format!("attempt {} refused", attempt),
            });
        }
        let mut inner = ScriptedTransport::new();
        if !self.tools.is_empty() {
            inner.tools = self.tools.clone();
        }
        inner.closes = self.closes.clone();
        inner.broken = self.broken.clone();
        Ok(Box::new(CountingTransport {
            inner,
            close_fails: self.close_fails,
            list_delay: self.list_delay,
        }))
    }
}
