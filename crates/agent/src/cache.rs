use ollama_agent_core::{Error, ReasoningEffort, Result};
use ollama_agent_tools::ToolRegistry;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// Display name of every top-level agent.
pub const AGENT_NAME: &str = "Ollama Assistant";

/// SHA-256 hex digest of instruction text.
pub fn instruction_hash(instructions: &str) -> String {
    let digest = Sha256::digest(instructions.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Identity of a cached agent. Capability names are sorted and deduplicated
/// so the binding order never produces a distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub model: String,
    pub effort: ReasoningEffort,
    pub instructions_hash: String,
    pub capabilities: Vec<String>,
}

impl AgentKey {
    pub fn new<I, S>(model: &str, effort: ReasoningEffort, instructions: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut capabilities: Vec<String> = capabilities.into_iter().map(Into::into).collect();
        capabilities.sort();
        capabilities.dedup();
        Self {
            model: model.to_string(),
            effort,
            instructions_hash: instruction_hash(instructions),
            capabilities,
        }
    }

    pub fn binds(&self, capability: &str) -> bool {
        self.capabilities.binary_search_by(|c| c.as_str().cmp(capability)).is_ok()
    }
}

/// A fully constructed agent: model settings, instructions and the tools
/// it may call.
pub struct AgentInstance {
    pub name: String,
    pub key: AgentKey,
    pub instructions: String,
    pub tools: ToolRegistry,
}

impl AgentInstance {
    pub fn new(key: AgentKey, instructions: String, tools: ToolRegistry) -> Self {
        Self {
            name: AGENT_NAME.to_string(),
            key,
            instructions,
            tools,
        }
    }

    pub fn model(&self) -> &str {
        &self.key.model
    }

    pub fn effort(&self) -> ReasoningEffort {
        self.key.effort
    }

    pub fn tool_schemas(&self) -> Vec<Value> {
        self.tools.get_tool_schemas()
    }
}

type Slot = Arc<OnceCell<Arc<AgentInstance>>>;

/// Process-wide memo of agent instances.
///
/// The map lock covers lookup only. Each key owns a cell that is filled
/// once, so concurrent resolves of one key build it once and wait for each
/// other, while other keys never wait on that build.
#[derive(Default)]
pub struct AgentCache {
    entries: Mutex<HashMap<AgentKey, Slot>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached instance for `key`, building it on a miss. A
    /// failed build is not cached.
    pub async fn resolve<F, Fut>(&self, key: AgentKey, build: F) -> Result<Arc<AgentInstance>>
    where
        F: FnOnce(AgentKey) -> Fut,
        Fut: Future<Output = Result<AgentInstance>>,
    {
        let slot = self.entries.lock().await.entry(key.clone()).or_default().clone();
        if let Some(instance) = slot.get() {
            debug!(model = %key.model, effort = %key.effort, "Agent cache hit");
            return Ok(instance.clone());
        }

        let build_key = key.clone();
        let built = slot
            .get_or_try_init(|| async move {
                let instance = build(build_key.clone()).await?;
                info!(
                    model = %build_key.model,
                    effort = %build_key.effort,
                    capabilities = ?build_key.capabilities,
                    "Agent constructed"
                );
                Ok::<_, Error>(Arc::new(instance))
            })
            .await
            .cloned();

        if built.is_err() {
            let mut entries = self.entries.lock().await;
            let unfilled = entries
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized());
            if unfilled {
                entries.remove(&key);
            }
        }
        built
    }

    /// Drop every entry whose key matches. Returns how many built
    /// instances were removed.
    pub async fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&AgentKey) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        entries.retain(|key, slot| {
            if !predicate(key) {
                return true;
            }
            if slot.initialized() {
                removed += 1;
            }
            false
        });
        if removed > 0 {
            debug!(removed, "Agent cache entries invalidated");
        }
        removed
    }

    pub async fn clear(&self) -> usize {
        self.invalidate(|_| true).await
    }

    /// Number of built instances.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
