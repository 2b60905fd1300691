pub mod cli;
pub mod config;
pub mod db;
pub mod gateway;
pub mod managers;
pub mod output;
pub mod runtime_state;
pub mod test_utils;

// Compiled-in agents register themselves through inventory; linking is enough.
use plugin_echo as _;

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::gateway::Gateway;
use crate::managers::{AgentRegistry, PluginLoader};
use crate::runtime_state::RuntimeStateManager;

/// Everything a running process shares.
pub struct AppState {
    pub config: AppConfig,
    pub loader: Arc<PluginLoader>,
    pub registry: Arc<AgentRegistry>,
    pub states: Arc<RuntimeStateManager>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Stops every subprocess agent the loader started.
    pub async fn shutdown(&self) {
        self.loader.shutdown_all().await;
    }
}

/// Connects the state store, discovers agents and wires the gateway.
pub async fn build_state(config: AppConfig) -> anyhow::Result<Arc<AppState>> {
    let pool = db::connect(&config.database_url).await?;
    let store = Arc::new(db::SqliteStateStore::new(pool));
    let states = Arc::new(RuntimeStateManager::new(store, config.state_defaults()));

    let health_timeout = Duration::from_secs(config.health_check_timeout_secs);
    let mut loader = PluginLoader::new(config.plugin_dir.clone(), health_timeout);
    loader.register_builtins();
    let loader = Arc::new(loader);
    let discovered = loader.discover().await;
    info!(count = discovered, "🔍 Agent discovery complete");

    let registry = Arc::new(
        AgentRegistry::with_loader(loader.clone()).with_health_check_timeout(health_timeout),
    );
    let registered = registry.register_discovered().await;
    let init = registry.initialize_all().await;
    let failed: Vec<&String> = init.iter().filter(|(_, ok)| !**ok).map(|(n, _)| n).collect();
    if !failed.is_empty() {
        warn!(agents = ?failed, "⚠️ Some agents failed to initialize");
    }
    info!(count = registered, "✅ Agents registered");

    let gateway = Arc::new(
        Gateway::new(registry.clone(), states.clone())
            .with_execution_timeout(Duration::from_secs(config.execution_timeout_secs))
            .with_failure_threshold(config.breaker_failure_threshold),
    );

    Ok(Arc::new(AppState {
        config,
        loader,
        registry,
        states,
        gateway,
    }))
}

/// Default entry point: boot, print the registry summary, stop.
pub async fn run_kernel(json_mode: bool) -> anyhow::Result<()> {
    info!("+---------------------------------------+");
    info!("|             Relay Runtime             |");
    info!("|             Version {:<10}        |", env!("CARGO_PKG_VERSION"));
    info!("+---------------------------------------+");

    let config = AppConfig::load()?;
    info!(
        "📍 Loaded Config: DB_URL={}, PLUGIN_DIR={}",
        config.database_url,
        config
            .plugin_dir
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string())
    );

    let state = build_state(config).await?;
    let info = state.registry.get_registry_info().await;
    let agents = state.registry.list_all().await;

    if json_mode {
        let data = serde_json::json!({ "registry": info, "agents": agents });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        output::print_registry_summary(&info);
        output::print_header("Registered Agents");
        output::print_agents_table(&agents);
        println!();
    }

    state.shutdown().await;
    Ok(())
}
