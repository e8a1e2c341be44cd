use async_trait::async_trait;
use ollama_agent_core::{ProviderDescriptor, Result, ToolResult};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::mcp::client::{McpClient, McpTool};
use crate::mcp::manager::ProviderManager;
use crate::{Tool, ToolContext, ToolSchema};

/// Separator between provider and tool in exposed capability names.
pub const NAME_SEPARATOR: &str = "__";

pub fn qualified_name(provider: &str, tool: &str) -> String {
    format!("{}{}{}", provider, NAME_SEPARATOR, tool)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Unstarted,
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

impl ProviderHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProviderHealth::Unstarted,
            1 => ProviderHealth::Starting,
            2 => ProviderHealth::Ready,
            3 => ProviderHealth::Failed,
            4 => ProviderHealth::Stopping,
            _ => ProviderHealth::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ProviderHealth::Unstarted => 0,
            ProviderHealth::Starting => 1,
            ProviderHealth::Ready => 2,
            ProviderHealth::Failed => 3,
            ProviderHealth::Stopping => 4,
            ProviderHealth::Stopped => 5,
        }
    }
}

impl fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderHealth::Unstarted => "unstarted",
            ProviderHealth::Starting => "starting",
            ProviderHealth::Ready => "ready",
            ProviderHealth::Failed => "failed",
            ProviderHealth::Stopping => "stopping",
            ProviderHealth::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A started capability provider. Teardown runs at most once no matter
/// how many times it is requested.
pub struct RunningProvider {
    descriptor: ProviderDescriptor,
    client: McpClient,
    health: AtomicU8,
    torn_down: AtomicBool,
    leases: AtomicUsize,
}

impl fmt::Debug for RunningProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningProvider")
            .field("descriptor", &self.descriptor)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl RunningProvider {
    pub(crate) fn new(descriptor: ProviderDescriptor, client: McpClient) -> Self {
        Self {
            descriptor,
            client,
            health: AtomicU8::new(ProviderHealth::Ready.as_u8()),
            torn_down: AtomicBool::new(false),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub fn health(&self) -> ProviderHealth {
        ProviderHealth::from_u8(self.health.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.health() == ProviderHealth::Ready
    }

    /// Record a fatal transport error; the next acquisition restarts it.
    pub fn mark_failed(&self) {
        let ready = ProviderHealth::Ready.as_u8();
        if self
            .health
            .compare_exchange(ready, ProviderHealth::Failed.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(provider = %self.descriptor.name, "Provider marked failed");
        }
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub(crate) fn lease_acquired(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn lease_released(&self) {
        self.leases.fetch_sub(1, Ordering::SeqCst);
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.client.list_tools().await
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolResult> {
        match self.client.call_tool(tool, arguments).await {
            Err(e) if e.is_transport() => {
                self.mark_failed();
                Err(e)
            }
            other => other,
        }
    }

    /// Release the connection. Returns `Ok(false)` if teardown already ran.
    pub async fn teardown(&self) -> Result<bool> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.health.store(ProviderHealth::Stopping.as_u8(), Ordering::SeqCst);
        let outcome = self.client.close().await;
        self.health.store(ProviderHealth::Stopped.as_u8(), Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                info!(provider = %self.descriptor.name, transport = self.client.transport_kind(), "Provider stopped");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

/// One provider tool exposed as `<provider>__<tool>`. The provider is
/// resolved through the manager on every call, so a restarted provider is
/// picked up transparently.
pub struct ProviderTool {
    manager: ProviderManager,
    descriptor: ProviderDescriptor,
    qualified: String,
    tool: McpTool,
}

impl ProviderTool {
    pub fn new(manager: ProviderManager, descriptor: ProviderDescriptor, tool: McpTool) -> Self {
        Self {
            qualified: qualified_name(&descriptor.name, &tool.name),
            manager,
            descriptor,
            tool,
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.descriptor.name
    }
}

#[async_trait]
impl Tool for ProviderTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.qualified.clone(),
            description: self.tool.description.clone().unwrap_or_default(),
            parameters: self.tool.input_schema.clone(),
        }
    }

    async fn execute(&self, _ctx: ToolContext, params: Value) -> Result<ToolResult> {
        info!(provider = %self.descriptor.name, tool = %self.tool.name, "Executing provider tool");
        self.manager
            .call_tool(&self.descriptor, &self.tool.name, params)
            .await
    }
}
