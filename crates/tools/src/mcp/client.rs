use ollama_agent_core::{Result, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::rpc::{McpTransport, PROTOCOL_VERSION};

// ─── MCP tool schema types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

// ─── MCP Client ───────────────────────────────────────────────────────────────

/// MCP session over any transport.
pub struct McpClient {
    server_name: String,
    transport: Box<dyn McpTransport>,
    cache_tools_list: bool,
    tools: Mutex<Option<Vec<McpTool>>>,
}

impl McpClient {
    pub fn new(server_name: &str, transport: Box<dyn McpTransport>, cache_tools_list: bool) -> Self {
        Self {
            server_name: server_name.to_string(),
            transport,
            cache_tools_list,
            tools: Mutex::new(None),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    /// `initialize` request followed by the `initialized` notification.
    pub async fn initialize(&self) -> Result<Value> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "ollama-agent",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.transport.request("initialize", Some(params)).await?;
        debug!(server = %self.server_name, ?result, "MCP initialized");
        self.transport.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Tools advertised by the server. Cached after the first fetch unless
    /// caching is disabled.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut cached = self.tools.lock().await;
        if self.cache_tools_list {
            if let Some(tools) = cached.as_ref() {
                return Ok(tools.clone());
            }
        }
        let result = self.transport.request("tools/list", None).await?;
        let tools: Vec<McpTool> =
            serde_json::from_value(result.get("tools").cloned().unwrap_or(Value::Array(vec![])))?;
        debug!(server = %self.server_name, count = tools.len(), "MCP tools loaded");
        *cached = Some(tools.clone());
        Ok(tools)
    }

    /// `tools/call`. A result flagged `isError` becomes an error result,
    /// not an `Err`.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolResult> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments
        });
        let result = self.transport.request("tools/call", Some(params)).await?;
        let text = content_text(&result);
        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            let msg = if text.is_empty() { "MCP tool returned an error".to_string() } else { text };
            return Ok(ToolResult::error(msg));
        }
        Ok(ToolResult::ok(text))
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// Joins the text blocks of an MCP content array; non-text content is
/// rendered as JSON.
fn content_text(result: &Value) -> String {
    match result.get("content").and_then(|c| c.as_array()) {
        Some(blocks) => blocks
            .iter()
            .map(|block| match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => block
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => match result.get("content") {
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::ScriptedTransport;
    use ollama_agent_core::ToolStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_initialize_sends_notification() {
        let transport = ScriptedTransport::new();
        let log = transport.log();
        let client = McpClient::new("fs", Box::new(transport), true);
        client.initialize().await.unwrap();
        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec!["initialize", "notifications/initialized"]);
    }

    #[tokio::test]
    async fn test_tools_list_cache() {
        let transport = ScriptedTransport::new();
        let log = transport.log();
        let client = McpClient::new("fs", Box::new(transport), true);
        assert_eq!(client.list_tools().await.unwrap()[0].name, "read_file");
        client.list_tools().await.unwrap();
        assert_eq!(log.lock().unwrap().iter().filter(|m| *m == "tools/list").count(), 1);

        let transport = ScriptedTransport::new();
        let log = transport.log();
        let client = McpClient::new("fs", Box::new(transport), false);
        client.list_tools().await.unwrap();
        client.list_tools().await.unwrap();
        assert_eq!(log.lock().unwrap().iter().filter(|m| *m == "tools/list").count(), 2);
    }

    #[tokio::test]
    async fn test_call_tool_maps_content() {
        let client = McpClient::new("fs", Box::new(ScriptedTransport::new()), true);
        let ok = client.call_tool("read_file", json!({"path": "/tmp/a"})).await.unwrap();
        assert_eq!(ok.status, ToolStatus::Ok);
        assert_eq!(ok.stdout, "contents of /tmp/a");

        let err = client.call_tool("fail", json!({})).await.unwrap();
        assert_eq!(err.status, ToolStatus::Error);
        assert_eq!(err.stderr, "file not found");
    }

    #[test]
    fn test_content_text_mixed_blocks() {
        let v = json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "image", "data": "xx", "mimeType": "image/png"}
        ]});
        let text = content_text(&v);
        assert!(text.starts_with("a\n"));
        assert!(text.contains("image/png"));
    }
}
