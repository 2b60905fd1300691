use chrono::{DateTime, Utc};
use futures::FutureExt;
use relay_shared::{
    Agent, AgentContext, AgentMetadata, AgentRequest, AgentResponse, Channel, ModelTier,
    RelayError, RelayResult,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::loader::{probe_health, PluginLoader};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryMetrics {
    pub registered_at: DateTime<Utc>,
    pub execution_count: u64,
    pub error_count: u64,
    pub total_execution_time_ms: u64,
}

impl RegistryMetrics {
    fn new() -> Self {
        Self {
            registered_at: Utc::now(),
            execution_count: 0,
            error_count: 0,
            total_execution_time_ms: 0,
        }
    }

    #[must_use]
    pub fn average_execution_time_ms(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.total_execution_time_ms as f64 / self.execution_count as f64
        }
    }

    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.execution_count as f64
        }
    }
}

/// Summary for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryInfo {
    pub total_agents: usize,
    pub by_tier: BTreeMap<String, usize>,
    pub by_channel: BTreeMap<String, usize>,
    pub total_executions: u64,
    pub total_errors: u64,
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    metadata: AgentMetadata,
    metrics: RegistryMetrics,
}

/// Directory of live agents. Built once at startup and shared.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    loader: Option<Arc<PluginLoader>>,
    health_check_timeout: Duration,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// A registry without a loader; `get` only sees explicitly registered agents.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            loader: None,
            health_check_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_loader(loader: Arc<PluginLoader>) -> Self {
        Self {
            loader: Some(loader),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    #[must_use]
    pub fn loader(&self) -> Option<&Arc<PluginLoader>> {
        self.loader.as_ref()
    }

    /// Registers under `agent.metadata().name`, replacing any previous entry.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> AgentMetadata {
        let metadata = agent.metadata();
        let name = metadata.name.clone();
        let entry = RegisteredAgent {
            agent,
            metadata: metadata.clone(),
            metrics: RegistryMetrics::new(),
        };

        let previous = self.agents.write().await.insert(name.clone(), entry);
        if previous.is_some() {
            warn!(agent = %name, "⚠️ Agent re-registered, replacing previous instance");
        } else {
            info!(agent = %name, version = %metadata.version, "📝 Agent registered");
        }
        metadata
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.agents.write().await.remove(name).is_some();
        if removed {
            info!(agent = %name, "Agent unregistered");
        }
        removed
    }

    /// Looks up `name`, asking the loader for it when not registered yet.
    pub async fn get(&self, name: &str) -> RelayResult<Arc<dyn Agent>> {
        if let Some(entry) = self.agents.read().await.get(name) {
            return Ok(entry.agent.clone());
        }

        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| RelayError::NotFound(name.to_string()))?;
        let agent = loader.load(name).await?;
        self.register(agent.clone()).await;
        Ok(agent)
    }

    pub async fn get_metadata(&self, name: &str) -> Option<AgentMetadata> {
        self.agents.read().await.get(name).map(|e| e.metadata.clone())
    }

    /// Metadata of every registered agent, ordered by name.
    pub async fn list_all(&self) -> Vec<AgentMetadata> {
        self.filter_metadata(|_| true).await
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn find_by_capability(&self, capability: &str) -> Vec<AgentMetadata> {
        self.filter_metadata(|m| m.has_capability(capability)).await
    }

    pub async fn find_by_channel(&self, channel: Channel) -> Vec<AgentMetadata> {
        self.filter_metadata(|m| m.supports_channel(channel)).await
    }

    pub async fn find_by_tier(&self, tier: ModelTier) -> Vec<AgentMetadata> {
        self.filter_metadata(|m| m.model_tier == tier).await
    }

    async fn filter_metadata(&self, pred: impl Fn(&AgentMetadata) -> bool) -> Vec<AgentMetadata> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentMetadata> = agents
            .values()
            .map(|e| &e.metadata)
            .filter(|m| pred(m))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Dispatch: validate, execute, post-process. Every outcome lands in the
    /// agent's metrics before returning.
    pub async fn execute(
        &self,
        name: &str,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> RelayResult<AgentResponse> {
        let agent = self.get(name).await?;
        let started = Instant::now();

        let run = async {
            if !agent.validate_input(request).await? {
                return Err(anyhow::Error::from(RelayError::execution(name, "validation failed")));
            }
            let response = agent.execute(request, context).await?;
            agent.post_process(response).await
        };
        let outcome = std::panic::AssertUnwindSafe(run).catch_unwind().await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Ok(mut response)) => {
                self.update_metrics(name, elapsed_ms, true).await;
                response.execution_time_ms = Some(elapsed_ms);
                debug!(agent = %name, elapsed_ms, "Agent execution succeeded");
                Ok(response)
            }
            Ok(Err(e)) => {
                self.update_metrics(name, elapsed_ms, false).await;
                let err = into_execution_error(name, e);
                warn!(agent = %name, elapsed_ms, error = %err, "❌ Agent execution failed");
                Err(err)
            }
            Err(_) => {
                self.update_metrics(name, elapsed_ms, false).await;
                error!(agent = %name, "🔥 Agent panicked during execution");
                Err(RelayError::execution(name, "agent panicked during execution"))
            }
        }
    }

    /// No-op for names that are not registered.
    pub async fn update_metrics(&self, name: &str, time_ms: u64, success: bool) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(name) {
            let m = &mut entry.metrics;
            m.execution_count += 1;
            m.total_execution_time_ms = m.total_execution_time_ms.saturating_add(time_ms);
            if !success {
                m.error_count += 1;
            }
        }
    }

    pub async fn get_metrics(&self, name: &str) -> Option<RegistryMetrics> {
        self.agents.read().await.get(name).map(|e| e.metrics.clone())
    }

    pub async fn get_all_metrics(&self) -> BTreeMap<String, RegistryMetrics> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(name, e)| (name.clone(), e.metrics.clone()))
            .collect()
    }

    pub async fn get_registry_info(&self) -> RegistryInfo {
        let agents = self.agents.read().await;
        let mut info = RegistryInfo {
            total_agents: agents.len(),
            ..RegistryInfo::default()
        };
        for entry in agents.values() {
            *info.by_tier.entry(entry.metadata.model_tier.to_string()).or_insert(0) += 1;
            for channel in &entry.metadata.channels {
                *info.by_channel.entry(channel.to_string()).or_insert(0) += 1;
            }
            info.total_executions += entry.metrics.execution_count;
            info.total_errors += entry.metrics.error_count;
        }
        info
    }

    async fn snapshot(&self) -> Vec<(String, Arc<dyn Agent>)> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(name, e)| (name.clone(), e.agent.clone()))
            .collect()
    }

    /// Health of every registered agent, checked concurrently.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        use futures::stream::{FuturesUnordered, StreamExt};

        let agents = self.snapshot().await;
        let limit = self.health_check_timeout;
        let mut checks: FuturesUnordered<_> = agents
            .into_iter()
            .map(|(name, agent)| async move {
                let healthy = probe_health(&name, agent, limit).await;
                (name, healthy)
            })
            .collect();

        let mut report = BTreeMap::new();
        while let Some((name, healthy)) = checks.next().await {
            report.insert(name, healthy);
        }
        report
    }

    /// Runs every registered agent's `initialize` hook concurrently. The map
    /// records which ones came up.
    pub async fn initialize_all(&self) -> BTreeMap<String, bool> {
        use futures::stream::{FuturesUnordered, StreamExt};

        let agents = self.snapshot().await;
        let limit = self.health_check_timeout;
        let mut inits: FuturesUnordered<_> = agents
            .into_iter()
            .map(|(name, agent)| async move {
                let init = std::panic::AssertUnwindSafe(agent.initialize()).catch_unwind();
                let ok = match tokio::time::timeout(limit, init).await {
                    Ok(Ok(Ok(()))) => true,
                    Ok(Ok(Err(e))) => {
                        error!(agent = %name, error = %e, "❌ Agent initialization failed");
                        false
                    }
                    Ok(Err(_)) => {
                        error!(agent = %name, "🔥 Agent panicked during initialization");
                        false
                    }
                    Err(_) => {
                        error!(agent = %name, "⏱️ Agent initialization timed out");
                        false
                    }
                };
                (name, ok)
            })
            .collect();

        let mut report = BTreeMap::new();
        while let Some((name, ok)) = inits.next().await {
            report.insert(name, ok);
        }
        report
    }

    /// Loads and registers everything the attached loader discovered.
    /// Returns the number of agents registered.
    pub async fn register_discovered(&self) -> usize {
        let Some(loader) = &self.loader else {
            return 0;
        };

        let mut registered = 0;
        let mut failed = Vec::new();
        for name in loader.discovered_names().await {
            match loader.load(&name).await {
                Ok(agent) => {
                    self.register(agent).await;
                    registered += 1;
                }
                Err(e) => {
                    error!(agent = %name, error = %e, "❌ Failed to load discovered agent");
                    failed.push(name);
                }
            }
        }
        if !failed.is_empty() {
            warn!(count = failed.len(), agents = ?failed, "⚠️ {} agent(s) failed to load", failed.len());
        }
        registered
    }

    /// Swaps in a fresh instance from the loader. Metrics start over.
    pub async fn reload(&self, name: &str) -> RelayResult<AgentMetadata> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| RelayError::Config("registry has no plugin loader".to_string()))?;
        let agent = loader.reload(name).await?;
        Ok(self.register(agent).await)
    }
}

/// Execution errors pass through; anything else is wrapped with the agent name.
fn into_execution_error(name: &str, err: anyhow::Error) -> RelayError {
    match err.downcast::<RelayError>() {
        Ok(e @ RelayError::Execution { .. }) => e,
        Ok(other) => RelayError::execution(name, other.to_string()),
        Err(e) => RelayError::execution(name, format!("{e:#}")),
    }
}
