use async_trait::async_trait;
use ollama_agent_core::types::{ChatMessage, ToolResult};
use ollama_agent_core::{DelegatedAgentSpec, Error, ProviderDescriptor, ReasoningEffort, Result};
use ollama_agent_providers::{ModelRequest, Provider};
use ollama_agent_tools::{Tool, ToolContext, ToolExecutor, ToolRegistry, ToolSchema};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::events::collect_round;

/// What a delegated agent borrows from the runtime that builds it.
#[derive(Clone)]
pub struct DelegateRuntime {
    pub model_client: Arc<dyn Provider>,
    pub executor: ToolExecutor,
    pub default_model: String,
    pub effort: ReasoningEffort,
    pub max_iterations: u32,
}

/// A provider's tools wrapped behind a sub-agent with its own model and
/// instructions, exposed to the parent as one tool taking `{ input }`.
pub struct DelegatedAgentTool {
    name: String,
    description: String,
    provider: String,
    model: String,
    instructions: String,
    tools: ToolRegistry,
    runtime: DelegateRuntime,
}

impl DelegatedAgentTool {
    pub fn new(
        descriptor: &ProviderDescriptor,
        spec: &DelegatedAgentSpec,
        tools: ToolRegistry,
        runtime: DelegateRuntime,
    ) -> Self {
        let name = spec
            .tool_name
            .clone()
            .unwrap_or_else(|| format!("{}_agent", descriptor.name));
        let description = spec.tool_description.clone().unwrap_or_else(|| {
            format!(
                "Delegate a task to the {} agent. Pass the complete request as input.",
                descriptor.name
            )
        });
        let model = spec.model.clone().unwrap_or_else(|| runtime.default_model.clone());
        Self {
            name,
            description,
            provider: descriptor.name.clone(),
            model,
            instructions: spec.instructions.clone(),
            tools,
            runtime,
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Tool for DelegatedAgentTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The task for the delegated agent"
                    }
                },
                "required": ["input"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        match params.get("input").and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => Ok(()),
            _ => Err(Error::Validation("Missing required parameter: input".to_string())),
        }
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let input = params["input"].as_str().unwrap_or_default();
        info!(tool = %self.name, provider = %self.provider, model = %self.model, "Delegating to sub-agent");

        let mut messages = Vec::new();
        if !self.instructions.is_empty() {
            messages.push(ChatMessage::system(&self.instructions));
        }
        messages.push(ChatMessage::user(input));
        let schemas = self.tools.get_tool_schemas();

        for round in 1..=self.runtime.max_iterations.max(1) {
            let request = ModelRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                tools: schemas.clone(),
                reasoning_effort: self.runtime.effort,
            };
            let output = collect_round(self.runtime.model_client.stream_chat(request).await?).await?;
            if output.tool_calls.is_empty() {
                debug!(tool = %self.name, rounds = round, "Sub-agent finished");
                return Ok(ToolResult::ok(output.text));
            }

            messages.push(ChatMessage::assistant_tool_calls(&output.text, output.tool_calls.clone()));
            for call in output.tool_calls {
                let result = match self
                    .runtime
                    .executor
                    .invoke_in(&self.tools, &call.name, call.arguments, Some(ctx.timeout), ctx.session_id.as_deref())
                    .await
                {
                    Ok(r) => r,
                    Err(e) => ToolResult::error(e.to_string()),
                };
                messages.push(ChatMessage::tool_result(&call.id, &result.to_model_content()));
            }
        }

        Err(Error::Tool(format!(
            "Delegated agent '{}' exceeded {} tool rounds",
            self.name, self.runtime.max_iterations
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ollama_agent_core::ToolStatus;
    use ollama_agent_providers::scripted::{ScriptRound, ScriptedProvider};
    use ollama_agent_tools::mcp::testing::ScriptedConnector;
    use ollama_agent_tools::ProviderManager;
    use std::time::Duration;

    fn runtime(model: &ScriptedProvider) -> DelegateRuntime {
        DelegateRuntime {
            model_client: Arc::new(model.clone()),
            executor: ToolExecutor::new(Duration::from_secs(5)),
            default_model: "gpt-oss:20b".to_string(),
            effort: ReasoningEffort::Low,
            max_iterations: 4,
        }
    }

    async fn fs_tools(descriptor: &ProviderDescriptor) -> ToolRegistry {
        let manager = ProviderManager::with_connector(Arc::new(ScriptedConnector::new()));
        let mut registry = ToolRegistry::new();
        for tool in manager.tools_for(descriptor).await.unwrap() {
            registry.register(tool);
        }
        registry
    }

    #[tokio::test]
    async fn test_delegate_runs_tool_loop() {
        let descriptor = ProviderDescriptor::stdio("fs", "unused", vec![]);
        let spec = DelegatedAgentSpec {
            model: Some("qwen3:8b".to_string()),
            instructions: "You manage files.".to_string(),
            tool_name: None,
            tool_description: None,
        };
        let model = ScriptedProvider::new()
            .with_round(ScriptRound::tool_call("c1", "fs__read_file", json!({"path": "/a"})))
            .with_round(ScriptRound::text(&["the file says ", "hello"]));

        let tool = DelegatedAgentTool::new(&descriptor, &spec, fs_tools(&descriptor).await, runtime(&model));
        assert_eq!(tool.schema().name, "fs_agent");
        assert_eq!(tool.model(), "qwen3:8b");

        let result = tool
            .execute(ToolContext::new(Duration::from_secs(5)), json!({"input": "read /a"}))
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Ok);
        assert_eq!(result.stdout, "the file says hello");

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].model, "qwen3:8b");
        assert_eq!(requests[0].messages[0].role, "system");
        assert_eq!(requests[0].tools.len(), 1);
        let tool_msg = requests[1].messages.iter().find(|m| m.role == "tool").unwrap();
        assert!(tool_msg.content.as_deref().unwrap().contains("contents of /a"));
    }

    #[tokio::test]
    async fn test_delegate_schema_and_validation() {
        let descriptor = ProviderDescriptor::stdio("git", "unused", vec![]);
        let spec = DelegatedAgentSpec {
            model: None,
            instructions: String::new(),
            tool_name: Some("ask_git".to_string()),
            tool_description: Some("Git helper".to_string()),
        };
        let model = ScriptedProvider::new();
        let tool = DelegatedAgentTool::new(&descriptor, &spec, ToolRegistry::new(), runtime(&model));
        let schema = tool.schema();
        assert_eq!(schema.name, "ask_git");
        assert_eq!(schema.description, "Git helper");
        assert_eq!(schema.parameters["required"][0], "input");
        assert_eq!(tool.model(), "gpt-oss:20b");
        assert!(tool.validate(&json!({})).is_err());
        assert!(tool.validate(&json!({"input": "  "})).is_err());
        assert!(tool.validate(&json!({"input": "status"})).is_ok());
    }

    #[tokio::test]
    async fn test_delegate_model_failure_is_err() {
        let descriptor = ProviderDescriptor::stdio("fs", "unused", vec![]);
        let spec = DelegatedAgentSpec::default();
        let model = ScriptedProvider::new().with_round(ScriptRound::Refuse("connection refused".into()));
        let tool = DelegatedAgentTool::new(&descriptor, &spec, ToolRegistry::new(), runtime(&model));
        let err = tool
            .execute(ToolContext::new(Duration::from_secs(5)), json!({"input": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "model_stream_error");
    }
}
