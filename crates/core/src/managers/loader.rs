use futures::FutureExt;
use relay_shared::{Agent, AgentFactory, LegacyAgent, RelayError, RelayResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::bridge::{read_descriptor, AgentDescriptor, BridgeAgent};
use super::legacy::LegacyAdapter;

/// Where a discovered agent comes from.
#[derive(Clone)]
pub enum AgentSource {
    /// Compiled-in agent registered through `#[relay_agent]` or `register_factory`.
    Native(Arc<dyn AgentFactory>),
    Legacy(Arc<dyn LegacyAgent>),
    /// Entry of a descriptor file in the plugin directory.
    Directory(AgentDescriptor),
}

impl AgentSource {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Legacy(_) => "legacy",
            Self::Directory(_) => "directory",
        }
    }
}

struct LoadedAgent {
    agent: Arc<dyn Agent>,
    bridge: Option<Arc<BridgeAgent>>,
}

impl LoadedAgent {
    async fn release(self) {
        if let Some(bridge) = self.bridge {
            bridge.shutdown().await;
        }
    }
}

/// Discovers agent implementations and hands out one cached instance per name.
pub struct PluginLoader {
    plugin_dir: Option<PathBuf>,
    health_check_timeout: Duration,
    factories: HashMap<String, Arc<dyn AgentFactory>>,
    legacy: HashMap<String, Arc<dyn LegacyAgent>>,
    discovered: RwLock<HashMap<String, AgentSource>>,
    instances: RwLock<HashMap<String, LoadedAgent>>,
    /// Descriptor files that produced a loaded instance.
    loaded_files: RwLock<HashSet<PathBuf>>,
}

impl PluginLoader {
    pub fn new(plugin_dir: Option<PathBuf>, health_check_timeout: Duration) -> Self {
        Self {
            plugin_dir,
            health_check_timeout,
            factories: HashMap::new(),
            legacy: HashMap::new(),
            discovered: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            loaded_files: RwLock::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn plugin_dir(&self) -> Option<&Path> {
        self.plugin_dir.as_deref()
    }

    pub fn register_factory(&mut self, factory: Arc<dyn AgentFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn register_legacy(&mut self, agent: Arc<dyn LegacyAgent>) {
        self.legacy.insert(agent.name().to_string(), agent);
    }

    /// Picks up every agent linked into the binary.
    pub fn register_builtins(&mut self) {
        info!("🔍 Scanning for compiled-in agents via inventory...");

        let mut native = 0;
        for registrar in relay_shared::inventory::iter::<relay_shared::AgentRegistrar> {
            let factory = (registrar.factory)();
            info!("📦 Discovered agent factory: {}", factory.name());
            self.register_factory(factory);
            native += 1;
        }

        let mut legacy = 0;
        for registrar in relay_shared::inventory::iter::<relay_shared::LegacyRegistrar> {
            let agent = (registrar.agent)();
            info!("📦 Discovered legacy agent: {}", agent.name());
            self.register_legacy(agent);
            legacy += 1;
        }

        if native + legacy == 0 {
            warn!("⚠️ No compiled-in agents discovered. Check that agent crates are linked into relay_core");
        } else {
            info!("✅ Discovered {} native and {} legacy agents", native, legacy);
        }
    }

    /// Rebuilds the discovered set from the module source and the plugin
    /// directory. Directory entries win on name collisions. Returns how many
    /// agents were discovered.
    pub async fn discover(&self) -> usize {
        let mut found: HashMap<String, AgentSource> = HashMap::new();

        for (name, agent) in &self.legacy {
            found.insert(name.clone(), AgentSource::Legacy(agent.clone()));
        }
        for (name, factory) in &self.factories {
            if found.insert(name.clone(), AgentSource::Native(factory.clone())).is_some() {
                warn!(agent = %name, "Native agent shadows legacy agent with the same name");
            }
        }

        if let Some(dir) = &self.plugin_dir {
            for descriptor in scan_directory(dir) {
                let name = descriptor.name.clone();
                if let Some(prev) = found.insert(name.clone(), AgentSource::Directory(descriptor)) {
                    info!(agent = %name, replaced = prev.kind(), "📂 Directory agent overrides existing entry");
                }
            }
        }

        let count = found.len();
        *self.discovered.write().await = found;
        debug!(count, "Agent discovery complete");
        count
    }

    pub async fn discovered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.discovered.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Where `name` was discovered from, if anywhere.
    pub async fn source_kind(&self, name: &str) -> Option<&'static str> {
        self.discovered.read().await.get(name).map(AgentSource::kind)
    }

    /// Cached instance for `name`, instantiating on first use. An unknown
    /// name triggers one re-discovery before `NotFound`.
    pub async fn load(&self, name: &str) -> RelayResult<Arc<dyn Agent>> {
        if let Some(loaded) = self.instances.read().await.get(name) {
            return Ok(loaded.agent.clone());
        }

        let mut source = self.discovered.read().await.get(name).cloned();
        if source.is_none() {
            debug!(agent = %name, "Unknown agent, re-running discovery");
            self.discover().await;
            source = self.discovered.read().await.get(name).cloned();
        }
        let source = source.ok_or_else(|| RelayError::NotFound(name.to_string()))?;

        let source_file = match &source {
            AgentSource::Directory(d) => Some(d.source.clone()),
            _ => None,
        };
        let loaded = instantiate(name, source).await?;

        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(name) {
            // Lost a race with a concurrent load; keep the first instance.
            return Ok(existing.agent.clone());
        }
        let agent = loaded.agent.clone();
        instances.insert(name.to_string(), loaded);
        drop(instances);

        if let Some(path) = source_file {
            self.loaded_files.write().await.insert(path);
        }
        info!(agent = %name, "🔌 Agent loaded");
        Ok(agent)
    }

    /// Subprocess handle behind a loaded directory agent.
    pub async fn bridge(&self, name: &str) -> Option<Arc<BridgeAgent>> {
        self.instances.read().await.get(name).and_then(|l| l.bridge.clone())
    }

    /// Drops the cached instance, re-reads descriptors and loads a fresh one.
    /// State held by the previous instance is lost.
    pub async fn reload(&self, name: &str) -> RelayResult<Arc<dyn Agent>> {
        let previous = self.instances.write().await.remove(name);
        if let Some(previous) = previous {
            previous.release().await;
        }

        let files: Vec<PathBuf> = self.loaded_files.read().await.iter().cloned().collect();
        for path in files {
            if let Err(e) = read_descriptor(&path) {
                warn!(file = %path.display(), error = %e, "Descriptor no longer loads cleanly");
            }
        }

        self.discover().await;
        info!(agent = %name, "♻️ Reloading agent");
        self.load(name).await
    }

    /// Removes the cached instance and the discovered entry. Returns whether
    /// anything was removed.
    pub async fn unload(&self, name: &str) -> bool {
        let instance = self.instances.write().await.remove(name);
        let discovered = self.discovered.write().await.remove(name);
        let removed = instance.is_some() || discovered.is_some();
        if let Some(instance) = instance {
            instance.release().await;
        }
        if removed {
            info!(agent = %name, "🗑️ Agent unloaded");
        }
        removed
    }

    /// Loads every discovered agent and runs its health check. Failures,
    /// panics and timeouts are reported as unhealthy.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        use futures::stream::{FuturesUnordered, StreamExt};

        let names = self.discovered_names().await;
        let mut checks = FuturesUnordered::new();
        for name in names {
            checks.push(async move {
                let healthy = match self.load(&name).await {
                    Ok(agent) => probe_health(&name, agent, self.health_check_timeout).await,
                    Err(e) => {
                        warn!(agent = %name, error = %e, "Agent failed to load for health check");
                        false
                    }
                };
                (name, healthy)
            });
        }

        let mut report = BTreeMap::new();
        while let Some((name, healthy)) = checks.next().await {
            report.insert(name, healthy);
        }
        report
    }

    /// Stops every subprocess-backed instance.
    pub async fn shutdown_all(&self) {
        let drained: Vec<LoadedAgent> = self.instances.write().await.drain().map(|(_, v)| v).collect();
        for loaded in drained {
            loaded.release().await;
        }
    }
}

async fn instantiate(name: &str, source: AgentSource) -> RelayResult<LoadedAgent> {
    match source {
        AgentSource::Native(factory) => {
            let created = std::panic::AssertUnwindSafe(factory.create()).catch_unwind().await;
            let agent = match created {
                Ok(Ok(agent)) => agent,
                Ok(Err(e)) => {
                    error!(agent = %name, error = %e, "❌ Agent construction failed");
                    return Err(RelayError::execution(name, format!("instantiation failed: {e}")));
                }
                Err(_) => {
                    error!(agent = %name, "🔥 Agent constructor panicked");
                    return Err(RelayError::execution(name, "instantiation panicked"));
                }
            };
            let actual = agent.metadata().name;
            if actual != name {
                return Err(RelayError::execution(
                    name,
                    format!("factory produced an agent named '{actual}'"),
                ));
            }
            Ok(LoadedAgent { agent, bridge: None })
        }
        AgentSource::Legacy(inner) => Ok(LoadedAgent {
            agent: Arc::new(LegacyAdapter::new(inner)),
            bridge: None,
        }),
        AgentSource::Directory(descriptor) => {
            let bridge = Arc::new(BridgeAgent::new(descriptor));
            Ok(LoadedAgent {
                agent: bridge.clone(),
                bridge: Some(bridge),
            })
        }
    }
}

pub(crate) async fn probe_health(name: &str, agent: Arc<dyn Agent>, limit: Duration) -> bool {
    let check = std::panic::AssertUnwindSafe(agent.health_check()).catch_unwind();
    match tokio::time::timeout(limit, check).await {
        Ok(Ok(Ok(healthy))) => healthy,
        Ok(Ok(Err(e))) => {
            warn!(agent = %name, error = %e, "Health check failed");
            false
        }
        Ok(Err(_)) => {
            error!(agent = %name, "🔥 Health check panicked");
            false
        }
        Err(_) => {
            warn!(agent = %name, "⏱️ Health check timed out");
            false
        }
    }
}

/// Parses every `*.toml` file in `dir`. A file that fails to read or parse is
/// logged and skipped; later files win on duplicate names.
fn scan_directory(dir: &Path) -> Vec<AgentDescriptor> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Plugin directory not readable, skipping");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();

    let mut by_name: BTreeMap<String, AgentDescriptor> = BTreeMap::new();
    for file in files {
        match read_descriptor(&file) {
            Ok(agents) => {
                for agent in agents {
                    if let Some(prev) = by_name.get(&agent.name) {
                        warn!(
                            agent = %agent.name,
                            first = %prev.source.display(),
                            second = %file.display(),
                            "Agent declared in two descriptor files, keeping the later one"
                        );
                    }
                    by_name.insert(agent.name.clone(), agent);
                }
            }
            Err(e) => {
                error!(file = %file.display(), error = %e, "❌ Skipping plugin descriptor");
            }
        }
    }
    by_name.into_values().collect()
}
