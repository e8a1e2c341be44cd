use ollama_agent_core::{Error, Result, ToolResult};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::registry::ToolRegistry;
use crate::ToolContext;

/// Slack past the budget before an unresponsive tool is abandoned. Tools
/// that enforce the budget themselves (subprocesses) finish inside it.
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// Runs capabilities under a process-wide default time budget.
#[derive(Clone)]
pub struct ToolExecutor {
    builtins: ToolRegistry,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            builtins: ToolRegistry::with_builtins(),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Built-in capabilities, available to every agent.
    pub fn builtins(&self) -> &ToolRegistry {
        &self.builtins
    }

    /// Invoke a built-in capability by name.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolResult> {
        self.invoke_in(&self.builtins, name, arguments, timeout, None).await
    }

    /// Invoke a capability from `registry`. Only an unknown name is an
    /// `Err`; every other failure is folded into the returned result.
    pub async fn invoke_in(
        &self,
        registry: &ToolRegistry,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
        session_id: Option<&str>,
    ) -> Result<ToolResult> {
        let tool = registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown tool: {}", name)))?
            .clone();

        if let Err(e) = tool.validate(&arguments) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Ok(ToolResult::error(e.to_string()));
        }

        let budget = timeout.unwrap_or(self.default_timeout);
        let mut ctx = ToolContext::new(budget);
        if let Some(id) = session_id {
            ctx = ctx.with_session(id);
        }

        info!(tool = name, timeout_secs = budget.as_secs_f64(), "Invoking tool");
        let started = Instant::now();
        let outcome = tokio::time::timeout(budget + TIMEOUT_GRACE, tool.execute(ctx, arguments)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(Ok(mut r)) => {
                if r.elapsed_seconds == 0.0 {
                    r.elapsed_seconds = elapsed;
                }
                r
            }
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "Tool execution failed");
                ToolResult::error(e.to_string()).with_elapsed(elapsed)
            }
            Err(_) => {
                warn!(tool = name, "Tool exceeded its time budget");
                ToolResult::timeout(
                    String::new(),
                    format!("tool '{}' timed out after {:.1}s", name, budget.as_secs_f64()),
                    elapsed,
                )
            }
        };
        debug!(tool = name, status = ?result.status, elapsed = result.elapsed_seconds, "Tool finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Tool, ToolSchema};
    use async_trait::async_trait;
    use ollama_agent_core::ToolStatus;
    use serde_json::json;
    use std::sync::Arc;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "slow".into(),
                description: "never finishes".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _ctx: ToolContext, _params: Value) -> Result<ToolResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolResult::ok("late"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "failing".into(),
                description: "always errors".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _ctx: ToolContext, _params: Value) -> Result<ToolResult> {
            Err(Error::Tool("backend unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_hard_error() {
        let exec = ToolExecutor::new(Duration::from_secs(5));
        let err = exec.invoke("nope", json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invoke_builtin_echo() {
        let exec = ToolExecutor::new(Duration::from_secs(5));
        let r = exec
            .invoke("execute_command", json!({"command": "echo hi"}), None)
            .await
            .unwrap();
        assert!(r.is_ok());
        assert_eq!(r.stdout, "hi\n");
        assert!(r.elapsed_seconds > 0.0);
    }

    #[tokio::test]
    async fn test_bad_arguments_become_error_result() {
        let exec = ToolExecutor::new(Duration::from_secs(5));
        let r = exec.invoke("execute_command", json!({}), None).await.unwrap();
        assert_eq!(r.status, ToolStatus::Error);
        assert!(r.stderr.contains("command"));
    }

    #[tokio::test]
    async fn test_per_call_timeout_overrides_default() {
        let exec = ToolExecutor::new(Duration::from_secs(60));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(SlowTool));
        let started = Instant::now();
        let r = exec
            .invoke_in(&reg, "slow", json!({}), Some(Duration::from_millis(200)), None)
            .await
            .unwrap();
        assert_eq!(r.status, ToolStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tool_error_is_absorbed() {
        let exec = ToolExecutor::new(Duration::from_secs(5));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FailingTool));
        let r = exec.invoke_in(&reg, "failing", json!({}), None, None).await.unwrap();
        assert_eq!(r.status, ToolStatus::Error);
        assert!(r.stderr.contains("backend unavailable"));
    }
}
