use relay_shared::Agent;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{init_db, SqliteStateStore};
use crate::gateway::Gateway;
use crate::managers::AgentRegistry;
use crate::runtime_state::{AgentStateConfig, RuntimeStateManager};

/// A migrated in-memory database.
pub async fn memory_pool() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    init_db(&pool).await?;
    Ok(pool)
}

pub async fn create_test_state_manager(defaults: AgentStateConfig) -> anyhow::Result<Arc<RuntimeStateManager>> {
    let store = Arc::new(SqliteStateStore::new(memory_pool().await?));
    Ok(Arc::new(RuntimeStateManager::new(store, defaults)))
}

/// Registry (no loader) pre-populated with `agents`.
pub async fn create_test_registry(agents: Vec<Arc<dyn Agent>>) -> Arc<AgentRegistry> {
    let registry = Arc::new(AgentRegistry::new().with_health_check_timeout(Duration::from_secs(1)));
    for agent in agents {
        registry.register(agent).await;
    }
    registry
}

pub async fn create_test_gateway(
    agents: Vec<Arc<dyn Agent>>,
    defaults: AgentStateConfig,
    execution_timeout: Duration,
    failure_threshold: u32,
) -> anyhow::Result<Gateway> {
    let registry = create_test_registry(agents).await;
    let states = create_test_state_manager(defaults).await?;
    Ok(Gateway::new(registry, states)
        .with_execution_timeout(execution_timeout)
        .with_failure_threshold(failure_threshold))
}
