use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use ollama_agent_core::{Error, ProviderDescriptor, Result, ToolResult, TransportSpec};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mcp::client::{McpClient, McpTool};
use crate::mcp::http::{HttpStreamTransport, SseTransport};
use crate::mcp::provider::{ProviderHealth, ProviderTool, RunningProvider};
use crate::mcp::rpc::{transport_error, McpTransport};
use crate::mcp::stdio::StdioTransport;
use crate::Tool;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Opens the transport for a descriptor.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, descriptor: &ProviderDescriptor) -> Result<Box<dyn McpTransport>>;
}

/// Connects over the transport named in the descriptor.
pub struct TransportConnector;

#[async_trait]
impl ProviderConnector for TransportConnector {
    async fn connect(&self, descriptor: &ProviderDescriptor) -> Result<Box<dyn McpTransport>> {
        let name = &descriptor.name;
        match &descriptor.transport {
            TransportSpec::Stdio { command, args, env, cwd } => Ok(Box::new(
                StdioTransport::spawn(name, command, args, env, cwd.as_deref()).await?,
            )),
            TransportSpec::HttpStream { url, headers, timeout_secs } => Ok(Box::new(
                HttpStreamTransport::new(name, url, headers, *timeout_secs)?,
            )),
            TransportSpec::Sse { url, headers, timeout_secs } => Ok(Box::new(
                SseTransport::connect(name, url, headers, *timeout_secs).await?,
            )),
        }
    }
}

type StartOutcome = std::result::Result<Arc<RunningProvider>, String>;
type StartFuture = Shared<BoxFuture<'static, StartOutcome>>;

enum Slot {
    Starting { generation: u64, start: StartFuture },
    Ready(Arc<RunningProvider>),
    Failed(String),
    Stopped,
}

#[derive(Default)]
struct Table {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

enum Next {
    Have(Arc<RunningProvider>),
    Wait(StartFuture),
    Start(Option<Arc<RunningProvider>>),
}

/// Outcome of [`ProviderManager::cleanup_all`].
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub stopped: usize,
    pub failures: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Process-wide table of capability providers.
///
/// Starts run in their own task and publish into the table when done, so a
/// caller that gives up waiting never aborts a start or leaks a provider.
#[derive(Clone)]
pub struct ProviderManager {
    table: Arc<Mutex<Table>>,
    connector: Arc<dyn ProviderConnector>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TransportConnector))
    }

    pub fn with_connector(connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            connector,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        lock_table(&self.table)
    }

    /// Return the ready provider, joining an in-flight start or beginning a
    /// new one as needed.
    pub async fn ensure_started(&self, descriptor: &ProviderDescriptor) -> Result<Arc<RunningProvider>> {
        let name = descriptor.name.clone();
        let start = {
            let mut table = self.lock();
            let next = match table.slots.get(&name) {
                Some(Slot::Ready(p)) if p.is_ready() => Next::Have(p.clone()),
                Some(Slot::Ready(p)) => Next::Start(Some(p.clone())),
                Some(Slot::Starting { start, .. }) => Next::Wait(start.clone()),
                _ => Next::Start(None),
            };
            match next {
                Next::Have(p) => return Ok(p),
                Next::Wait(start) => start,
                Next::Start(stale) => {
                    if let Some(old) = stale {
                        info!(provider = %name, "Re-establishing failed provider");
                        tokio::spawn(async move {
                            if let Err(e) = old.teardown().await {
                                warn!(provider = %old.name(), error = %e, "Teardown of failed provider errored");
                            }
                        });
                    }
                    self.begin_start(&mut table, descriptor.clone())
                }
            }
        };

        start.await.map_err(|message| Error::ProviderStartup { name, message })
    }

    fn begin_start(&self, table: &mut Table, descriptor: ProviderDescriptor) -> StartFuture {
        table.next_generation += 1;
        let generation = table.next_generation;
        let name = descriptor.name.clone();
        let connector = self.connector.clone();
        let shared_table = self.table.clone();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let outcome = start_with_retries(connector.as_ref(), &descriptor).await;
            publish(&shared_table, &task_name, generation, outcome).await
        });
        let start = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("start task failed: {}", e)),
            }
        }
        .boxed()
        .shared();

        debug!(provider = %name, generation, "Provider start scheduled");
        table.slots.insert(
            name,
            Slot::Starting {
                generation,
                start: start.clone(),
            },
        );
        start
    }

    /// Scoped acquisition: the lease keeps a handle to the started provider
    /// and releases it on drop. The provider itself stays cached.
    pub async fn acquire(&self, descriptor: &ProviderDescriptor) -> Result<ProviderLease> {
        let provider = self.ensure_started(descriptor).await?;
        provider.lease_acquired();
        Ok(ProviderLease { provider })
    }

    pub fn state(&self, name: &str) -> ProviderHealth {
        match self.lock().slots.get(name) {
            None => ProviderHealth::Unstarted,
            Some(Slot::Starting { .. }) => ProviderHealth::Starting,
            Some(Slot::Ready(p)) => p.health(),
            Some(Slot::Failed(_)) => ProviderHealth::Failed,
            Some(Slot::Stopped) => ProviderHealth::Stopped,
        }
    }

    /// Last startup failure message, if the provider is in the failed state.
    pub fn last_error(&self, name: &str) -> Option<String> {
        match self.lock().slots.get(name) {
            Some(Slot::Failed(message)) => Some(message.clone()),
            _ => None,
        }
    }

    /// Names of providers currently ready, sorted.
    pub fn ready_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Ready(p) if p.is_ready() => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Capability descriptors offered by the provider. The listing is
    /// bounded by the provider's startup timeout; a provider that does not
    /// answer in time is marked failed.
    pub async fn list_capabilities(&self, descriptor: &ProviderDescriptor) -> Result<Vec<McpTool>> {
        let provider = self.ensure_started(descriptor).await?;
        let limit = Duration::from_secs(descriptor.startup_timeout_secs.max(1));
        let listed = match tokio::time::timeout(limit, provider.list_tools()).await {
            Ok(listed) => listed,
            Err(_) => Err(transport_error(
                &descriptor.name,
                format!("tools/list gave no answer within {}s", limit.as_secs()),
            )),
        };
        match listed {
            Err(e) if e.is_transport() => {
                warn!(provider = %descriptor.name, error = %e, "Capability listing failed");
                provider.mark_failed();
                Err(e)
            }
            other => other,
        }
    }

    /// Provider capabilities wrapped as tools named `<provider>__<tool>`.
    pub async fn tools_for(&self, descriptor: &ProviderDescriptor) -> Result<Vec<Arc<dyn Tool>>> {
        let tools = self.list_capabilities(descriptor).await?;
        Ok(tools
            .into_iter()
            .map(|t| Arc::new(ProviderTool::new(self.clone(), descriptor.clone(), t)) as Arc<dyn Tool>)
            .collect())
    }

    /// Call a provider capability, restarting the provider first if it failed.
    pub async fn call_tool(
        &self,
        descriptor: &ProviderDescriptor,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolResult> {
        let provider = self.ensure_started(descriptor).await?;
        provider.call_tool(tool, arguments).await
    }

    /// Stop and forget one provider.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let slot = self.lock().slots.remove(name);
        match slot {
            Some(Slot::Ready(p)) => {
                p.teardown().await?;
            }
            // The start task sees its slot gone and tears the provider down itself.
            Some(Slot::Starting { start, .. }) => {
                let _ = start.await;
            }
            _ => {}
        }
        info!(provider = %name, "Provider removed");
        Ok(())
    }

    /// Tear down every provider exactly once, collecting failures. Providers
    /// still starting are waited for and torn down by their start task.
    pub async fn cleanup_all(&self) -> CleanupReport {
        let (ready, starting) = {
            let mut table = self.lock();
            let mut ready = Vec::new();
            let mut starting = Vec::new();
            for slot in table.slots.values_mut() {
                match std::mem::replace(slot, Slot::Stopped) {
                    Slot::Ready(p) => ready.push(p),
                    Slot::Starting { start, .. } => starting.push(start),
                    Slot::Failed(msg) => *slot = Slot::Failed(msg),
                    Slot::Stopped => {}
                }
            }
            (ready, starting)
        };

        let mut report = CleanupReport::default();
        for provider in ready {
            match provider.teardown().await {
                Ok(true) => report.stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(provider = %provider.name(), error = %e, "Provider teardown failed");
                    report.failures.push((provider.name().to_string(), e.to_string()));
                }
            }
        }
        for start in starting {
            let _ = start.await;
        }
        if report.stopped > 0 || !report.failures.is_empty() {
            info!(stopped = report.stopped, failures = report.failures.len(), "Providers cleaned up");
        }
        report
    }
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_table(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn connect_once(connector: &dyn ProviderConnector, descriptor: &ProviderDescriptor) -> Result<RunningProvider> {
    let transport = connector.connect(descriptor).await?;
    let client = McpClient::new(&descriptor.name, transport, descriptor.cache_tools_list);
    if let Err(e) = client.initialize().await {
        let _ = client.close().await;
        return Err(e);
    }
    Ok(RunningProvider::new(descriptor.clone(), client))
}

async fn start_with_retries(connector: &dyn ProviderConnector, descriptor: &ProviderDescriptor) -> Result<Arc<RunningProvider>> {
    let attempts = descriptor.attempts();
    let budget = Duration::from_secs(descriptor.startup_timeout_secs.max(1));
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        info!(
            provider = %descriptor.name,
            transport = descriptor.transport.kind(),
            attempt,
            attempts,
            "Starting provider"
        );
        match tokio::time::timeout(budget, connect_once(connector, descriptor)).await {
            Ok(Ok(provider)) => {
                info!(provider = %descriptor.name, attempt, "Provider ready");
                return Ok(Arc::new(provider));
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("startup timed out after {}s", budget.as_secs()),
        }
        warn!(provider = %descriptor.name, attempt, error = %last_error, "Provider start attempt failed");
        if attempt < attempts {
            tokio::time::sleep(RETRY_BACKOFF * attempt).await;
        }
    }

    Err(Error::ProviderStartup {
        name: descriptor.name.clone(),
        message: format!("gave up after {} attempt(s): {}", attempts, last_error),
    })
}

async fn publish(table: &Mutex<Table>, name: &str, generation: u64, outcome: Result<Arc<RunningProvider>>) -> StartOutcome {
    let current = {
        let mut table = lock_table(table);
        let current = matches!(
            table.slots.get(name),
            Some(Slot::Starting { generation: g, .. }) if *g == generation
        );
        if current {
            let slot = match &outcome {
                Ok(p) => Slot::Ready(p.clone()),
                Err(e) => Slot::Failed(startup_message(e)),
            };
            table.slots.insert(name.to_string(), slot);
        }
        current
    };

    match outcome {
        Ok(provider) if !current => {
            debug!(provider = %name, "Start superseded, tearing down");
            if let Err(e) = provider.teardown().await {
                warn!(provider = %name, error = %e, "Teardown after superseded start failed");
            }
            Err("provider was shut down during startup".to_string())
        }
        Ok(provider) => Ok(provider),
        Err(e) => Err(startup_message(&e)),
    }
}

fn startup_message(e: &Error) -> String {
    match e {
        Error::ProviderStartup { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// A scoped handle to a started provider.
pub struct ProviderLease {
    provider: Arc<RunningProvider>,
}

impl ProviderLease {
    pub fn provider(&self) -> &Arc<RunningProvider> {
        &self.provider
    }
}

impl Deref for ProviderLease {
    type Target = RunningProvider;

    fn deref(&self) -> &RunningProvider {
        &self.provider
    }
}

impl Drop for ProviderLease {
    fn drop(&mut self) {
        self.provider.lease_released();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::ScriptedConnector;
    use ollama_agent_core::ToolStatus;
    use serde_json::json;

    fn desc(name: &str) -> ProviderDescriptor {
        ProviderDescriptor::stdio(name, "unused", vec![])
    }

    fn manager(connector: &ScriptedConnector) -> ProviderManager {
        ProviderManager::with_connector(Arc::new(connector.clone()))
    }

    #[tokio::test]
    async fn test_concurrent_ensure_started_runs_one_start() {
        let connector = ScriptedConnector::new().with_delay(Duration::from_millis(100));
        let mgr = manager(&connector);
        let d = desc("fs");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mgr = mgr.clone();
                let d = d.clone();
                tokio::spawn(async move { mgr.ensure_started(&d).await.unwrap() })
            })
            .collect();
        let mut providers = Vec::new();
        for h in handles {
            providers.push(h.await.unwrap());
        }

        assert_eq!(connector.attempts(), 1);
        assert!(providers.iter().all(|p| Arc::ptr_eq(p, &providers[0])));
        assert_eq!(mgr.state("fs"), ProviderHealth::Ready);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let connector = ScriptedConnector::new().failing_first(2);
        let mgr = manager(&connector);
        let p = mgr.ensure_started(&desc("fs").with_retry_count(3)).await.unwrap();
        assert!(p.is_ready());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_cache_nothing() {
        let connector = ScriptedConnector::new().always_failing();
        let mgr = manager(&connector);
        let err = mgr
            .ensure_started(&desc("fs").with_retry_count(3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_startup_error");
        assert_eq!(connector.attempts(), 3);
        assert_eq!(mgr.state("fs"), ProviderHealth::Failed);
        assert!(mgr.ready_providers().is_empty());
        assert!(mgr.last_error("fs").unwrap().contains("3 attempt"));

        // A later call starts over rather than reusing the failure.
        let _ = mgr.ensure_started(&desc("fs").with_retry_count(1)).await;
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test]
    async fn test_startup_timeout_per_attempt() {
        let connector = ScriptedConnector::new().with_delay(Duration::from_secs(5));
        let mgr = manager(&connector);
        let started = std::time::Instant::now();
        let err = mgr
            .ensure_started(&desc("slow").with_retry_count(1).with_startup_timeout(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_abort_start() {
        let connector = ScriptedConnector::new().with_delay(Duration::from_millis(200));
        let mgr = manager(&connector);
        let d = desc("fs");

        let waiter = {
            let mgr = mgr.clone();
            let d = d.clone();
            tokio::spawn(async move { mgr.ensure_started(&d).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiter.abort();
        assert_eq!(mgr.state("fs"), ProviderHealth::Starting);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.state("fs"), ProviderHealth::Ready);
        mgr.ensure_started(&d).await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_all_is_idempotent() {
        let connector = ScriptedConnector::new();
        let mgr = manager(&connector);
        mgr.ensure_started(&desc("a")).await.unwrap();
        mgr.ensure_started(&desc("b")).await.unwrap();

        let first = mgr.cleanup_all().await;
        assert_eq!(first.stopped, 2);
        assert!(first.is_clean());
        let second = mgr.cleanup_all().await;
        assert_eq!(second.stopped, 0);
        assert_eq!(connector.closes(), 2);
        assert_eq!(mgr.state("a"), ProviderHealth::Stopped);
    }

    #[tokio::test]
    async fn test_cleanup_without_ready_providers() {
        let connector = ScriptedConnector::new().always_failing();
        let mgr = manager(&connector);
        let _ = mgr.ensure_started(&desc("x").with_retry_count(1)).await;
        let report = mgr.cleanup_all().await;
        assert_eq!(report.stopped, 0);
        assert!(report.is_clean());
        assert_eq!(connector.closes(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_during_startup_tears_down_once() {
        let connector = ScriptedConnector::new().with_delay(Duration::from_millis(200));
        let mgr = manager(&connector);
        let pending = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.ensure_started(&desc("late")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        mgr.cleanup_all().await;
        assert_eq!(connector.closes(), 1);
        assert!(pending.await.unwrap().is_err());
        mgr.cleanup_all().await;
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_teardown_failures_are_collected() {
        let connector = ScriptedConnector::new().with_failing_close();
        let mgr = manager(&connector);
        mgr.ensure_started(&desc("a")).await.unwrap();
        mgr.ensure_started(&desc("b")).await.unwrap();
        let report = mgr.cleanup_all().await;
        assert_eq!(report.failures.len(), 2);
        assert_eq!(connector.closes(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_restarts_provider() {
        let connector = ScriptedConnector::new();
        let mgr = manager(&connector);
        let d = desc("fs");
        mgr.ensure_started(&d).await.unwrap();

        connector.break_transports();
        let err = mgr.call_tool(&d, "read_file", json!({"path": "/a"})).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(mgr.state("fs"), ProviderHealth::Failed);

        connector.repair_transports();
        let r = mgr.call_tool(&d, "read_file", json!({"path": "/a"})).await.unwrap();
        assert_eq!(r.status, ToolStatus::Ok);
        assert_eq!(connector.attempts(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_unanswered_listing_times_out_and_fails_provider() {
        let connector = ScriptedConnector::new().with_list_delay(Duration::from_secs(3600));
        let mgr = manager(&connector);
        let d = desc("slow").with_startup_timeout(1);

        let started = std::time::Instant::now();
        let err = mgr.tools_for(&d).await.err().unwrap();
        assert!(err.is_transport());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(mgr.state("slow"), ProviderHealth::Failed);
    }

    #[tokio::test]
    async fn test_lease_tracks_usage() {
        let connector = ScriptedConnector::new();
        let mgr = manager(&connector);
        let d = desc("fs");
        let lease = mgr.acquire(&d).await.unwrap();
        assert_eq!(lease.name(), "fs");
        assert_eq!(lease.active_leases(), 1);
        let provider = lease.provider().clone();
        drop(lease);
        assert_eq!(provider.active_leases(), 0);
        assert!(provider.is_ready());
    }

    #[tokio::test]
    async fn test_tools_for_uses_qualified_names() {
        let connector = ScriptedConnector::new().with_tools(&["read_file", "write_file"]);
        let mgr = manager(&connector);
        let tools = mgr.tools_for(&desc("fs")).await.unwrap();
        let mut names: Vec<String> = tools.iter().map(|t| t.schema().name).collect();
        names.sort();
        assert_eq!(names, vec!["fs__read_file", "fs__write_file"]);
    }

    #[tokio::test]
    async fn test_remove_stops_provider() {
        let connector = ScriptedConnector::new();
        let mgr = manager(&connector);
        mgr.ensure_started(&desc("fs")).await.unwrap();
        mgr.remove("fs").await.unwrap();
        assert_eq!(mgr.state("fs"), ProviderHealth::Unstarted);
        assert_eq!(connector.closes(), 1);
        assert_eq!(mgr.cleanup_all().await.stopped, 0);
    }
}
