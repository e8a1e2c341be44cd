use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use ollama_agent_core::types::{ChatMessage, ToolExchange, ToolResult};
use ollama_agent_core::{
    Config, ConversationItem, Error, ProviderDescriptor, ReasoningEffort, Result, StreamEvent,
    DEFAULT_INSTRUCTIONS,
};
use ollama_agent_providers::{ModelChunk, ModelRequest, Provider};
use ollama_agent_storage::SessionStore;
use ollama_agent_tools::{CleanupReport, ProviderManager, ToolExecutor, ToolRegistry};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{instruction_hash, AgentCache, AgentInstance, AgentKey};
use crate::delegate::{DelegateRuntime, DelegatedAgentTool};
use crate::events::normalize;

/// Ordered, single-pass events of one turn.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Everything the dispatcher needs, passed in explicitly.
pub struct RuntimeContext {
    pub config: Config,
    pub store: SessionStore,
    pub model_client: Arc<dyn Provider>,
    pub executor: ToolExecutor,
    pub providers: ProviderManager,
    pub descriptors: Vec<ProviderDescriptor>,
    pub instructions: String,
}

impl RuntimeContext {
    pub fn new(config: Config, store: SessionStore, model_client: Arc<dyn Provider>) -> Self {
        let executor = ToolExecutor::new(Duration::from_secs(config.builtin_tool_timeout.max(1)));
        Self {
            config,
            store,
            model_client,
            executor,
            providers: ProviderManager::new(),
            descriptors: Vec::new(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }

    pub fn with_providers(mut self, providers: ProviderManager, descriptors: Vec<ProviderDescriptor>) -> Self {
        self.providers = providers;
        self.descriptors = descriptors;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Process-wide budget for one tool invocation.
    pub fn tool_timeout(&self) -> Duration {
        self.executor.default_timeout()
    }
}

/// Per-turn overrides of the dispatcher defaults.
#[derive(Debug, Clone, Default)]
pub struct TurnOverrides {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    /// Restrict the turn to these capabilities. Named providers become
    /// required for the turn.
    pub capabilities: Option<Vec<String>>,
    pub tool_timeout: Option<Duration>,
}

impl TurnOverrides {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }

    pub fn capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }
}

struct Settings {
    instructions: String,
    descriptors: Vec<ProviderDescriptor>,
}

struct TurnPlan {
    model: String,
    effort: ReasoningEffort,
    tool_timeout: Duration,
    providers: Vec<(ProviderDescriptor, bool)>,
}

struct Inner {
    config: Config,
    default_effort: ReasoningEffort,
    store: SessionStore,
    model_client: Arc<dyn Provider>,
    executor: ToolExecutor,
    providers: ProviderManager,
    cache: AgentCache,
    settings: RwLock<Settings>,
}

/// Turns user input into ordered events, running tools and persisting the
/// finished turn. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RuntimeDispatcher {
    inner: Arc<Inner>,
}

impl RuntimeDispatcher {
    pub fn new(ctx: RuntimeContext) -> Result<Self> {
        let default_effort = ctx.config.effort()?;
        info!(
            model = %ctx.config.model,
            effort = %default_effort,
            providers = ctx.descriptors.len(),
            tool_timeout_secs = ctx.executor.default_timeout().as_secs(),
            "Runtime dispatcher ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                default_effort,
                store: ctx.store,
                model_client: ctx.model_client,
                executor: ctx.executor,
                providers: ctx.providers,
                cache: AgentCache::new(),
                settings: RwLock::new(Settings {
                    instructions: ctx.instructions,
                    descriptors: ctx.descriptors,
                }),
                config: ctx.config,
            }),
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.inner.providers
    }

    pub fn cache(&self) -> &AgentCache {
        &self.inner.cache
    }

    pub fn max_tool_iterations(&self) -> u32 {
        self.inner.config.max_tool_iterations.max(1)
    }

    pub fn instructions(&self) -> String {
        self.read_settings(|s| s.instructions.clone())
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.read_settings(|s| s.descriptors.clone())
    }

    fn read_settings<T>(&self, f: impl FnOnce(&Settings) -> T) -> T {
        match self.inner.settings.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_settings<T>(&self, f: impl FnOnce(&mut Settings) -> T) -> T {
        match self.inner.settings.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Swap the instruction text. Agents built for other instructions are
    /// dropped from the cache.
    pub async fn set_instructions(&self, instructions: impl Into<String>) {
        let instructions = instructions.into();
        let hash = instruction_hash(&instructions);
        self.write_settings(|s| s.instructions = instructions);
        let removed = self.inner.cache.invalidate(|k| k.instructions_hash != hash).await;
        info!(removed, "Instructions updated");
    }

    /// Replace the provider set. Providers that were removed or whose
    /// descriptor changed are torn down, and agents bound to them dropped.
    pub async fn set_providers(&self, descriptors: Vec<ProviderDescriptor>) {
        let old = self.write_settings(|s| std::mem::replace(&mut s.descriptors, descriptors.clone()));

        let stale: Vec<String> = old
            .iter()
            .filter(|o| !descriptors.iter().any(|n| n == *o))
            .map(|o| o.name.clone())
            .collect();
        for name in &stale {
            if let Err(e) = self.inner.providers.remove(name).await {
                warn!(provider = %name, error = %e, "Failed to stop provider");
            }
        }
        let removed = self
            .inner
            .cache
            .invalidate(|k| stale.iter().any(|name| k.binds(name)))
            .await;
        info!(providers = descriptors.len(), stale = stale.len(), removed, "Providers reconfigured");
    }

    /// Tear down every started provider.
    pub async fn shutdown(&self) -> CleanupReport {
        self.inner.providers.cleanup_all().await
    }

    fn plan_turn(&self, overrides: &TurnOverrides) -> Result<TurnPlan> {
        let config = &self.inner.config;
        let model = overrides.model.as_deref().unwrap_or(&config.model).trim().to_string();
        if model.is_empty() {
            return Err(Error::Config("Model name must not be empty".to_string()));
        }

        let effort = match overrides.reasoning_effort.as_deref() {
            Some(raw) => ReasoningEffort::parse(raw, config.effort_policy)?,
            None => self.inner.default_effort,
        };

        let tool_timeout = overrides.tool_timeout.unwrap_or_else(|| self.inner.executor.default_timeout());
        if tool_timeout.is_zero() {
            return Err(Error::Config("Tool timeout must be positive".to_string()));
        }

        let descriptors = self.descriptors();
        let providers = match &overrides.capabilities {
            Some(names) => {
                let builtins = self.inner.executor.builtins();
                for name in names {
                    if !builtins.contains(name) && !descriptors.iter().any(|d| &d.name == name) {
                        return Err(Error::Config(format!("Unknown capability '{}'", name)));
                    }
                }
                let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
                descriptors
                    .into_iter()
                    .filter(|d| wanted.contains(d.name.as_str()))
                    .map(|d| (d, true))
                    .collect()
            }
            None => descriptors
                .into_iter()
                .map(|d| {
                    let required = d.required;
                    (d, required)
                })
                .collect(),
        };

        Ok(TurnPlan {
            model,
            effort,
            tool_timeout,
            providers,
        })
    }

    async fn resolve_agent(&self, plan: &TurnPlan, bound: Vec<ProviderDescriptor>) -> Result<Arc<AgentInstance>> {
        let instructions = self.instructions();
        let builtins = self.inner.executor.builtins().tool_names();
        let names = builtins.into_iter().chain(bound.iter().map(|d| d.name.clone()));
        let key = AgentKey::new(&plan.model, plan.effort, &instructions, names);

        self.inner
            .cache
            .resolve(key, |key| self.build_agent(key, instructions, bound))
            .await
    }

    async fn build_agent(
        &self,
        key: AgentKey,
        instructions: String,
        bound: Vec<ProviderDescriptor>,
    ) -> Result<AgentInstance> {
        if key.model.trim().is_empty() {
            return Err(Error::Config("Model name must not be empty".to_string()));
        }
        if self.inner.config.is_toolless(&key.model) {
            return Err(Error::Config(format!(
                "Model '{}' does not support tools",
                key.model
            )));
        }

        let mut tools = self.inner.executor.builtins().clone();
        for descriptor in &bound {
            let provider_tools = self.inner.providers.tools_for(descriptor).await?;
            match &descriptor.delegated {
                Some(spec) => {
                    let mut sub_tools = ToolRegistry::new();
                    for tool in provider_tools {
                        sub_tools.register(tool);
                    }
                    let runtime = DelegateRuntime {
                        model_client: self.inner.model_client.clone(),
                        executor: self.inner.executor.clone(),
                        default_model: key.model.clone(),
                        effort: key.effort,
                        max_iterations: self.max_tool_iterations(),
                    };
                    tools.register(Arc::new(DelegatedAgentTool::new(descriptor, spec, sub_tools, runtime)));
                }
                None => {
                    for tool in provider_tools {
                        tools.register(tool);
                    }
                }
            }
        }
        debug!(model = %key.model, tools = ?tools.tool_names(), "Agent tools bound");
        Ok(AgentInstance::new(key, instructions, tools))
    }

    /// Run one turn, yielding events as they happen. Any unrecoverable
    /// failure ends the stream with exactly one `error` event. Dropping the
    /// stream cancels the turn and kills in-flight tool processes; started
    /// providers are unaffected.
    pub fn run_streamed(&self, session_id: &str, user_text: &str, overrides: TurnOverrides) -> EventStream {
        self.turn(session_id.to_string(), user_text.to_string(), overrides)
            .map(|outcome| outcome.unwrap_or_else(|e| StreamEvent::error(&e)))
            .boxed()
    }

    /// Run one turn to completion and return the assistant text.
    pub async fn run(&self, session_id: &str, user_text: &str, overrides: TurnOverrides) -> Result<String> {
        let mut events = self.turn(session_id.to_string(), user_text.to_string(), overrides);
        let mut text = String::new();
        while let Some(event) = events.next().await {
            if let StreamEvent::TextDelta(t) = event? {
                text.push_str(&t);
            }
        }
        Ok(text)
    }

    fn turn(
        &self,
        session_id: String,
        user_text: String,
        overrides: TurnOverrides,
    ) -> BoxStream<'static, Result<StreamEvent>> {
        let this = self.clone();
        let stream = stream! {
            let plan = match this.plan_turn(&overrides) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Turn rejected");
                    yield Err(e);
                    return;
                }
            };
            let history = match this.inner.store.load(&session_id) {
                Ok(items) => items,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Failed to load history");
                    yield Err(e);
                    return;
                }
            };
            info!(
                session_id = %session_id,
                model = %plan.model,
                effort = %plan.effort,
                history = history.len(),
                "Starting turn"
            );

            let mut bound = Vec::new();
            for (descriptor, required) in &plan.providers {
                match this.inner.providers.ensure_started(descriptor).await {
                    Ok(_) => bound.push(descriptor.clone()),
                    Err(e) if *required => {
                        error!(provider = %descriptor.name, error = %e, "Required provider unavailable");
                        yield Err(e);
                        return;
                    }
                    Err(e) => {
                        warn!(provider = %descriptor.name, error = %e, "Continuing without provider");
                        yield Ok(StreamEvent::AgentUpdate {
                            name: descriptor.name.clone(),
                            detail: format!("provider unavailable: {}", e),
                        });
                    }
                }
            }

            let agent = match this.resolve_agent(&plan, bound).await {
                Ok(agent) => agent,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            yield Ok(StreamEvent::AgentUpdate {
                name: agent.name.clone(),
                detail: format!("model {} (reasoning {})", agent.model(), agent.effort()),
            });

            let mut messages = vec![ChatMessage::system(&agent.instructions)];
            messages.extend(history.iter().flat_map(ChatMessage::from_item));
            messages.push(ChatMessage::user(&user_text));
            let tools = agent.tool_schemas();
            let max_rounds = this.max_tool_iterations();

            let mut text = String::new();
            let mut exchanges: Vec<ToolExchange> = Vec::new();
            let mut rounds = 0u32;
            loop {
                let request = ModelRequest {
                    model: agent.model().to_string(),
                    messages: messages.clone(),
                    tools: tools.clone(),
                    reasoning_effort: agent.effort(),
                };
                let mut chunks = match this.inner.model_client.stream_chat(request).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Model stream failed to open");
                        yield Err(e);
                        return;
                    }
                };

                let mut round_text = String::new();
                let mut calls = Vec::new();
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(ModelChunk::ToolCall(call)) => {
                            yield Ok(StreamEvent::ToolCall {
                                call_id: call.id.clone(),
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            });
                            calls.push(call);
                        }
                        Ok(ModelChunk::Done { .. }) => break,
                        Ok(other) => {
                            if let Some(event) = normalize(&other) {
                                if let StreamEvent::TextDelta(t) = &event {
                                    round_text.push_str(t);
                                }
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            error!(session_id = %session_id, error = %e, "Model stream failed");
                            yield Err(e);
                            return;
                        }
                    }
                }
                text.push_str(&round_text);
                if calls.is_empty() {
                    break;
                }
                if rounds >= max_rounds {
                    yield Err(Error::ModelStream(format!(
                        "Model kept requesting tools after {} rounds",
                        max_rounds
                    )));
                    return;
                }
                rounds += 1;

                messages.push(ChatMessage::assistant_tool_calls(&round_text, calls.clone()));
                for call in calls {
                    let result = match this
                        .inner
                        .executor
                        .invoke_in(
                            &agent.tools,
                            &call.name,
                            call.arguments.clone(),
                            Some(plan.tool_timeout),
                            Some(&session_id),
                        )
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "Model requested an unavailable tool");
                            ToolResult::error(e.to_string())
                        }
                    };
                    yield Ok(StreamEvent::ToolOutput {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        result: result.clone(),
                    });
                    messages.push(ChatMessage::tool_result(&call.id, &result.to_model_content()));
                    exchanges.push(ToolExchange {
                        call_id: call.id,
                        name: call.name,
                        arguments: call.arguments,
                        result,
                    });
                }
            }

            let tool_count = exchanges.len();
            let items = [
                ConversationItem::user(user_text.as_str()),
                ConversationItem::assistant(text.as_str()).with_tool_calls(exchanges),
            ];
            if let Err(e) = this.inner.store.append_turn(&session_id, &items) {
                error!(session_id = %session_id, error = %e, "Failed to persist turn");
                yield Err(e);
                return;
            }
            info!(session_id = %session_id, rounds, tool_calls = tool_count, "Turn complete");
        };
        stream.boxed()
    }
}
