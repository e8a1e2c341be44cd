pub mod client;
pub mod openai;

#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;
use ollama_agent_core::types::{ChatMessage, ReasoningEffort, ToolCallRequest};
use ollama_agent_core::Result;
use serde_json::Value;

/// One streaming completion request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool schemas in OpenAI function form. Empty means no `tools` field.
    pub tools: Vec<Value>,
    pub reasoning_effort: ReasoningEffort,
}

/// A raw fragment of a model stream, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ReasoningSummary(String),
    /// A fully assembled tool call. Argument fragments are joined by the
    /// provider before this is yielded.
    ToolCall(ToolCallRequest),
    Done { finish_reason: String },
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk>>;

/// A chat model reachable over a streaming API.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Open a stream. Errors before the first byte (connection refused,
    /// non-2xx status) are returned here; later failures arrive as stream
    /// items.
    async fn stream_chat(&self, request: ModelRequest) -> Result<ModelStream>;
}

pub use openai::OpenAICompatProvider;
