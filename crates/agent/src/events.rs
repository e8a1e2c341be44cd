use futures::StreamExt;
use ollama_agent_core::types::ToolCallRequest;
use ollama_agent_core::{Result, StreamEvent};
use ollama_agent_providers::{ModelChunk, ModelStream};

/// Map a model fragment to the caller-facing event. Empty deltas and
/// fragments with no caller-facing meaning (tool calls, `Done`) map to `None`.
pub fn normalize(chunk: &ModelChunk) -> Option<StreamEvent> {
    match chunk {
        ModelChunk::TextDelta(t) if !t.is_empty() => Some(StreamEvent::TextDelta(t.clone())),
        ModelChunk::ReasoningDelta(t) if !t.is_empty() => Some(StreamEvent::ReasoningDelta(t.clone())),
        ModelChunk::ReasoningSummary(t) if !t.is_empty() => {
            Some(StreamEvent::ReasoningSummary(t.clone()))
        }
        _ => None,
    }
}

/// Everything one model round produced, for callers that don't stream.
#[derive(Debug, Default)]
pub struct RoundOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Drain one model round. Reasoning is discarded; the first stream error
/// aborts the round.
pub async fn collect_round(mut stream: ModelStream) -> Result<RoundOutput> {
    let mut out = RoundOutput::default();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            ModelChunk::TextDelta(t) => out.text.push_str(&t),
            ModelChunk::ToolCall(call) => out.tool_calls.push(call),
            ModelChunk::Done { .. } => break,
            ModelChunk::ReasoningDelta(_) | ModelChunk::ReasoningSummary(_) => {}
        }
    }
    Ok(out)
}
