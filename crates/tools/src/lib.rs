pub mod exec;
pub mod executor;
pub mod mcp;
pub mod registry;

use async_trait::async_trait;
use ollama_agent_core::{Result, ToolResult};
use serde_json::Value;
use std::time::Duration;

pub use exec::ExecuteCommandTool;
pub use executor::ToolExecutor;
pub use mcp::{
    qualified_name, CleanupReport, McpTool, ProviderConnector, ProviderHealth, ProviderLease,
    ProviderManager, ProviderTool, RunningProvider, TransportConnector,
};
pub use registry::ToolRegistry;

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Like [`safe_truncate`], appending a marker when anything was cut.
pub fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    format!("{}\n... (output truncated)", safe_truncate(&s, max_bytes))
}

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Wall-clock budget for this invocation.
    pub timeout: Duration,
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A named capability the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    /// Run the capability. An `Err` is reported to the model as an error
    /// result; it never aborts the turn.
    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult>;
}
