use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Conversation items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One tool call made during a turn, with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExchange {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub role: Role,
    pub content: String,
    /// Position within the session, assigned by the store.
    #[serde(default)]
    pub ordinal: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolExchange>,
    pub created_at: DateTime<Utc>,
}

impl ConversationItem {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ordinal: 0,
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolExchange>) -> Self {
        self.tool_calls = calls;
        self
    }
}

// ---------------------------------------------------------------------------
// Tool results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_seconds: f64,
}

impl ToolResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Ok,
            exit_code: None,
            stdout: stdout.into(),
            stderr: String::new(),
            elapsed_seconds: 0.0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
            elapsed_seconds: 0.0,
        }
    }

    pub fn timeout(stdout: String, stderr: String, elapsed_seconds: f64) -> Self {
        Self {
            status: ToolStatus::Timeout,
            exit_code: None,
            stdout,
            stderr,
            elapsed_seconds,
        }
    }

    pub fn with_elapsed(mut self, elapsed_seconds: f64) -> Self {
        self.elapsed_seconds = elapsed_seconds;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// Text handed back to the model as the tool message content.
    pub fn to_model_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.stdout.clone())
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// A normalized unit of a turn's progress.
///
/// Wire form is `{ "type": <tag>, "payload": <value> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ReasoningSummary(String),
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolOutput {
        call_id: String,
        name: String,
        result: ToolResult,
    },
    AgentUpdate {
        name: String,
        detail: String,
    },
    Error {
        kind: String,
        message: String,
    },
}

const EVENT_TAGS: &[&str] = &[
    "text_delta",
    "reasoning_delta",
    "reasoning_summary",
    "tool_call",
    "tool_output",
    "agent_update",
    "error",
];

impl StreamEvent {
    pub fn error(err: &Error) -> Self {
        StreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta(_) => "text_delta",
            StreamEvent::ReasoningDelta(_) => "reasoning_delta",
            StreamEvent::ReasoningSummary(_) => "reasoning_summary",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolOutput { .. } => "tool_output",
            StreamEvent::AgentUpdate { .. } => "agent_update",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }

    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decodes a wire event. Unknown tags yield `None`.
    pub fn from_wire(value: &serde_json::Value) -> Option<Self> {
        let tag = value.get("type")?.as_str()?;
        if !EVENT_TAGS.contains(&tag) {
            return None;
        }
        match serde_json::from_value(value.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(tag, error = %e, "Malformed stream event payload");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reasoning effort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    /// No reasoning parameter is sent.
    Disabled,
}

/// How an unrecognized effort string is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortPolicy {
    /// Substitute `medium` and log a warning.
    #[default]
    Fallback,
    /// Reject with a configuration error.
    Strict,
}

impl ReasoningEffort {
    pub fn parse(raw: &str, policy: EffortPolicy) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            "disabled" | "none" | "off" => Ok(ReasoningEffort::Disabled),
            _ => match policy {
                EffortPolicy::Fallback => {
                    warn!(effort = %raw, "Invalid reasoning effort, using 'medium'");
                    Ok(ReasoningEffort::Medium)
                }
                EffortPolicy::Strict => Err(Error::Config(format!(
                    "invalid reasoning effort '{}': expected low, medium, high or disabled",
                    raw
                ))),
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Disabled => "disabled",
        }
    }

    /// Value of the `reasoning_effort` request parameter, if any.
    pub fn as_param(&self) -> Option<&'static str> {
        match self {
            ReasoningEffort::Disabled => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Model messages
// ---------------------------------------------------------------------------

/// A tool call requested by the model. Serializes to the OpenAI-compatible
/// `{id, type: "function", function: {name, arguments}}` shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry(
            "function",
            &serde_json::json!({
                "name": self.name,
                "arguments": self.arguments.to_string()
            }),
        )?;
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::plain("assistant", content)
    }

    pub fn assistant_tool_calls(content: &str, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: if content.is_empty() { None } else { Some(content.to_string()) },
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    /// Expands a persisted item into model messages. An assistant item with
    /// embedded tool exchanges becomes the tool-call message, one tool
    /// message per result, then the final text.
    pub fn from_item(item: &ConversationItem) -> Vec<ChatMessage> {
        match item.role {
            Role::User => vec![ChatMessage::user(&item.content)],
            Role::Tool => vec![ChatMessage::plain("tool", &item.content)],
            Role::Assistant if item.tool_calls.is_empty() => {
                vec![ChatMessage::assistant(&item.content)]
            }
            Role::Assistant => {
                let calls = item
                    .tool_calls
                    .iter()
                    .map(|x| ToolCallRequest {
                        id: x.call_id.clone(),
                        name: x.name.clone(),
                        arguments: x.arguments.clone(),
                    })
                    .collect();
                let mut out = vec![ChatMessage::assistant_tool_calls("", calls)];
                for x in &item.tool_calls {
                    out.push(ChatMessage::tool_result(&x.call_id, &x.result.to_model_content()));
                }
                if !item.content.is_empty() {
                    out.push(ChatMessage::assistant(&item.content));
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let ev = StreamEvent::TextDelta("hi".into());
        assert_eq!(ev.to_wire(), json!({"type": "text_delta", "payload": "hi"}));

        let ev = StreamEvent::AgentUpdate {
            name: "assistant".into(),
            detail: "ready".into(),
        };
        assert_eq!(
            ev.to_wire(),
            json!({"type": "agent_update", "payload": {"name": "assistant", "detail": "ready"}})
        );
    }

    #[test]
    fn test_from_wire_ignores_unknown_tags() {
        assert!(StreamEvent::from_wire(&json!({"type": "raw_response", "payload": 1})).is_none());
        assert!(StreamEvent::from_wire(&json!({"payload": "x"})).is_none());
        let ev = StreamEvent::from_wire(&json!({
            "type": "error",
            "payload": {"kind": "storage_error", "message": "disk"}
        }))
        .unwrap();
        assert!(ev.is_error());
    }

    #[test]
    fn test_tool_result_wire() {
        let r = ToolResult::ok("hi\n").with_elapsed(0.5);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["exit_code"], serde_json::Value::Null);
        assert_eq!(v["stdout"], "hi\n");
        assert_eq!(v["elapsed_seconds"], 0.5);
    }

    #[test]
    fn test_effort_policies() {
        assert_eq!(
            ReasoningEffort::parse("HIGH", EffortPolicy::Strict).unwrap(),
            ReasoningEffort::High
        );
        assert_eq!(
            ReasoningEffort::parse("extreme", EffortPolicy::Fallback).unwrap(),
            ReasoningEffort::Medium
        );
        let err = ReasoningEffort::parse("extreme", EffortPolicy::Strict).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
        assert_eq!(ReasoningEffort::Disabled.as_param(), None);
        assert_eq!(ReasoningEffort::Low.as_param(), Some("low"));
    }

    #[test]
    fn test_assistant_item_expands_tool_exchanges() {
        let item = ConversationItem::assistant("done").with_tool_calls(vec![ToolExchange {
            call_id: "c1".into(),
            name: "execute_command".into(),
            arguments: json!({"command": "echo hi"}),
            result: ToolResult::ok("hi\n"),
        }]);
        let msgs = ChatMessage::from_item(&item);
        assert_eq!(msgs.len(), 3);
        assert!(msgs[0].tool_calls.is_some());
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(msgs[2].content.as_deref(), Some("done"));

        let v = serde_json::to_value(&msgs[0]).unwrap();
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert_eq!(v["tool_calls"][0]["function"]["arguments"], "{\"command\":\"echo hi\"}");
    }
}
