use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use ollama_agent_core::types::ToolCallRequest;
use ollama_agent_core::{Config, Error, Result, SseParser};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::build_http_client;
use crate::{ModelChunk, ModelRequest, ModelStream, Provider};

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Streaming `/chat/completions` client for OpenAI-compatible servers,
/// Ollama's `/v1` endpoint included.
pub struct OpenAICompatProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAICompatProvider {
    pub fn new(base_url: &str, api_key: &str, proxy: Option<&str>) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = build_http_client(proxy, &base_url, Duration::from_secs(30));
        Self {
            client,
            api_key: api_key.to_string(),
            base_url,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.base_url, &config.api_key, config.proxy.as_deref())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
            body["tool_choice"] = json!("auto");
        }
        if let Some(effort) = request.reasoning_effort.as_param() {
            body["reasoning_effort"] = json!(effort);
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn stream_chat(&self, request: ModelRequest) -> Result<ModelStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(&request);
        info!(
            url = %url,
            model = %request.model,
            tools_count = request.tools.len(),
            messages_count = request.messages.len(),
            effort = %request.reasoning_effort,
            "Calling model"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ModelStream(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let raw_body = response.text().await.unwrap_or_default();
            let end = truncate_at_char_boundary(&raw_body, 500);
            error!(status = %status, body = %&raw_body[..end], "Model API error");
            return Err(Error::ModelStream(format!("API error {}: {}", status, &raw_body[..end])));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = try_stream! {
            let mut parser = SseParser::new();
            let mut decoder = ChunkDecoder::default();
            while let Some(next) = bytes.next().await {
                let data = next.map_err(|e| Error::ModelStream(format!("Stream interrupted: {}", e)))?;
                for frame in parser.feed(&data) {
                    for chunk in decoder.decode(&frame.data)? {
                        yield chunk;
                    }
                }
                if decoder.is_done() {
                    break;
                }
            }
            if let Some(frame) = parser.finish() {
                for chunk in decoder.decode(&frame.data)? {
                    yield chunk;
                }
            }
            for chunk in decoder.finish() {
                yield chunk;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns `data:` payloads of a chat-completions stream into [`ModelChunk`]s.
/// Tool-call fragments are accumulated per index and released, in index
/// order, when the stream finishes.
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
    done: bool,
}

impl ChunkDecoder {
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn decode(&mut self, data: &str) -> Result<Vec<ModelChunk>> {
        let data = data.trim();
        if data.is_empty() || self.done {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(self.finish());
        }

        let event: Value = serde_json::from_str(data).map_err(|e| {
            let end = truncate_at_char_boundary(data, 200);
            Error::ModelStream(format!("Malformed stream chunk: {}. Data: {}", e, &data[..end]))
        })?;
        if let Some(err) = event.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(Error::ModelStream(message));
        }

        let mut out = Vec::new();
        let choice = &event["choices"][0];
        let delta = &choice["delta"];

        // Ollama sends `reasoning`, other servers `reasoning_content`.
        for key in ["reasoning_content", "reasoning"] {
            if let Some(text) = delta[key].as_str().filter(|t| !t.is_empty()) {
                out.push(ModelChunk::ReasoningDelta(text.to_string()));
            }
        }
        if let Some(text) = delta["reasoning_summary"].as_str().filter(|t| !t.is_empty()) {
            out.push(ModelChunk::ReasoningSummary(text.to_string()));
        }
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            out.push(ModelChunk::TextDelta(text.to_string()));
        }
        if let Some(fragments) = delta["tool_calls"].as_array() {
            for fragment in fragments {
                let index = fragment["index"].as_u64().unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = fragment["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = fragment["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(out)
    }

    /// Flush accumulated tool calls followed by `Done`. Later calls yield
    /// nothing.
    pub(crate) fn finish(&mut self) -> Vec<ModelChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut out = Vec::new();
        for (index, call) in std::mem::take(&mut self.calls) {
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str::<Value>(&call.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool call arguments are not valid JSON");
                        Value::String(call.arguments.clone())
                    }
                }
            };
            let id = if call.id.is_empty() { format!("call_{}", index) } else { call.id };
            out.push(ModelChunk::ToolCall(ToolCallRequest {
                id,
                name: call.name,
                arguments,
            }));
        }
        let has_calls = !out.is_empty();
        let finish_reason = self.finish_reason.take().unwrap_or_else(|| {
            if has_calls { "tool_calls".to_string() } else { "stop".to_string() }
        });
        debug!(finish_reason = %finish_reason, tool_calls = out.len(), "Model stream finished");
        out.push(ModelChunk::Done { finish_reason });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use ollama_agent_core::types::{ChatMessage, ReasoningEffort};

    fn request(effort: ReasoningEffort, tools: Vec<Value>) -> ModelRequest {
        ModelRequest {
            model: "gpt-oss:20b".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("2+2?")],
            tools,
            reasoning_effort: effort,
        }
    }

    fn chunk(delta: Value) -> String {
        json!({"choices": [{"index": 0, "delta": delta}]}).to_string()
    }

    #[test]
    fn test_build_body_effort_and_tools() {
        let body = OpenAICompatProvider::build_body(&request(ReasoningEffort::High, vec![]));
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][0]["role"], "system");

        let tools = vec![json!({"type": "function", "function": {"name": "execute_command"}})];
        let body = OpenAICompatProvider::build_body(&request(ReasoningEffort::Disabled, tools));
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "execute_command");
    }

    #[test]
    fn test_decode_classifies_fragments() {
        let mut d = ChunkDecoder::default();
        assert_eq!(
            d.decode(&chunk(json!({"reasoning": "thinking"}))).unwrap(),
            vec![ModelChunk::ReasoningDelta("thinking".into())]
        );
        assert_eq!(
            d.decode(&chunk(json!({"reasoning_content": "more"}))).unwrap(),
            vec![ModelChunk::ReasoningDelta("more".into())]
        );
        assert_eq!(
            d.decode(&chunk(json!({"role": "assistant", "content": "4"}))).unwrap(),
            vec![ModelChunk::TextDelta("4".into())]
        );
        assert!(d.decode(&chunk(json!({"content": ""}))).unwrap().is_empty());
        assert_eq!(
            d.decode("[DONE]").unwrap(),
            vec![ModelChunk::Done { finish_reason: "stop".into() }]
        );
        assert!(d.is_done());
        assert!(d.finish().is_empty());
    }

    #[test]
    fn test_decode_assembles_tool_call_fragments() {
        let mut d = ChunkDecoder::default();
        d.decode(&chunk(json!({"tool_calls": [
            {"index": 0, "id": "call_a", "function": {"name": "execute_command", "arguments": "{\"comm"}}
        ]})))
        .unwrap();
        d.decode(&chunk(json!({"tool_calls": [
            {"index": 0, "function": {"arguments": "and\": \"echo hi\"}"}}
        ]})))
        .unwrap();
        let finish = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]});
        d.decode(&finish.to_string()).unwrap();

        let out = d.finish();
        assert_eq!(out.len(), 2);
        match &out[0] {
            ModelChunk::ToolCall(call) => {
                assert_eq!(call.id, "call_a");
                assert_eq!(call.name, "execute_command");
                assert_eq!(call.arguments, json!({"command": "echo hi"}));
            }
            other => panic!("unexpected chunk {:?}", other),
        }
        assert_eq!(out[1], ModelChunk::Done { finish_reason: "tool_calls".into() });
    }

    #[test]
    fn test_decode_missing_id_and_bad_arguments() {
        let mut d = ChunkDecoder::default();
        d.decode(&chunk(json!({"tool_calls": [
            {"index": 1, "function": {"name": "x", "arguments": "{not json"}}
        ]})))
        .unwrap();
        let out = d.finish();
        match &out[0] {
            ModelChunk::ToolCall(call) => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.arguments, Value::String("{not json".into()));
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        let mut d = ChunkDecoder::default();
        let err = d.decode(r#"{"error": {"message": "model not found"}}"#).unwrap_err();
        assert_eq!(err.kind(), "model_stream_error");
        assert!(err.to_string().contains("model not found"));

        let err = ChunkDecoder::default().decode("{truncated").unwrap_err();
        assert_eq!(err.kind(), "model_stream_error");
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    #[tokio::test]
    async fn test_stream_chat_over_http() {
        let body = [
            format!("data: {}\n\n", chunk(json!({"reasoning": "add"}))),
            format!("data: {}\n\n", chunk(json!({"content": "2+2"}))),
            format!("data: {}\n\n", chunk(json!({"content": " = 4"}))),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let body = body.clone();
                async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }
            }),
        );
        let base = serve(router).await;

        let provider = OpenAICompatProvider::new(&base, "ollama", None);
        let stream = provider.stream_chat(request(ReasoningEffort::Medium, vec![])).await.unwrap();
        let chunks: Vec<ModelChunk> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(
            chunks,
            vec![
                ModelChunk::ReasoningDelta("add".into()),
                ModelChunk::TextDelta("2+2".into()),
                ModelChunk::TextDelta(" = 4".into()),
                ModelChunk::Done { finish_reason: "stop".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_chat_http_error_status() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::NOT_FOUND, "model 'nope' not found") }),
        );
        let base = serve(router).await;
        let provider = OpenAICompatProvider::new(&base, "ollama", None);
        let err = match provider.stream_chat(request(ReasoningEffort::Low, vec![])).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), "model_stream_error");
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_stream_chat_unreachable() {
        let provider = OpenAICompatProvider::new("http://127.0.0.1:1/v1", "ollama", None);
        assert!(provider.stream_chat(request(ReasoningEffort::Low, vec![])).await.is_err());
    }
}
