use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use std::str::FromStr;
use tokio::time::{timeout, Duration};
use tracing::info;

use crate::runtime_state::{AgentRuntimeState, StateKey};

// Keeps a locked database from stalling dispatch indefinitely.
const DB_TIMEOUT_SECS: u64 = 10;
const MAX_KEY_LEN: usize = 255;

/// Durable storage for runtime-state documents.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, key: &StateKey) -> anyhow::Result<Option<AgentRuntimeState>>;
    async fn save_state(&self, state: &AgentRuntimeState) -> anyhow::Result<()>;
    async fn list_tenant_states(&self, tenant_id: &str) -> anyhow::Result<Vec<AgentRuntimeState>>;
}

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn validate_key_part(label: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        return Err(anyhow::anyhow!("{} must not be empty", label));
    }
    if value.contains('\0') || value.len() > MAX_KEY_LEN {
        return Err(anyhow::anyhow!(
            "{} must not contain null bytes and must be <= {} chars",
            label,
            MAX_KEY_LEN
        ));
    }
    Ok(())
}

fn validate_key(key: &StateKey) -> anyhow::Result<()> {
    validate_key_part("tenant_id", &key.tenant_id)?;
    validate_key_part("agent_name", &key.agent_name)
}

async fn with_timeout<T, F>(fut: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    timeout(Duration::from_secs(DB_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS))?
        .map_err(anyhow::Error::from)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_state(&self, key: &StateKey) -> anyhow::Result<Option<AgentRuntimeState>> {
        validate_key(key)?;

        let row: Option<(String,)> = with_timeout(
            sqlx::query_as(
                "SELECT state FROM agent_runtime_state WHERE tenant_id = ? AND agent_name = ?",
            )
            .bind(&key.tenant_id)
            .bind(&key.agent_name)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load runtime state for '{}': {}", key, e))?;

        match row {
            Some((raw,)) => {
                let state = serde_json::from_str(&raw).map_err(|e| {
                    anyhow::anyhow!("Corrupt runtime state document for '{}': {}", key, e)
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save_state(&self, state: &AgentRuntimeState) -> anyhow::Result<()> {
        let key = state.key();
        validate_key(&key)?;

        let doc = serde_json::to_string(state)?;
        with_timeout(
            sqlx::query(
                "INSERT INTO agent_runtime_state (tenant_id, agent_name, status, state, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(tenant_id, agent_name) DO UPDATE SET \
                 status = excluded.status, state = excluded.state, updated_at = excluded.updated_at",
            )
            .bind(&key.tenant_id)
            .bind(&key.agent_name)
            .bind(state.status.to_string())
            .bind(doc)
            .bind(state.created_at.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to save runtime state for '{}': {}", key, e))?;

        Ok(())
    }

    async fn list_tenant_states(&self, tenant_id: &str) -> anyhow::Result<Vec<AgentRuntimeState>> {
        validate_key_part("tenant_id", tenant_id)?;

        let rows: Vec<(String,)> = with_timeout(
            sqlx::query_as(
                "SELECT state FROM agent_runtime_state WHERE tenant_id = ? ORDER BY agent_name LIMIT 1000",
            )
            .bind(tenant_id)
            .fetch_all(&self.pool),
        )
        .await?;

        let mut states = Vec::with_capacity(rows.len());
        for (raw,) in rows {
            match serde_json::from_str::<AgentRuntimeState>(&raw) {
                Ok(s) => states.push(s),
                Err(e) => tracing::warn!(tenant = %tenant_id, error = %e, "Skipping corrupt runtime state row"),
            }
        }
        Ok(states)
    }
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Running database migrations...");

    const MIGRATION_TIMEOUT_SECS: u64 = 30;
    timeout(
        Duration::from_secs(MIGRATION_TIMEOUT_SECS),
        sqlx::migrate!("./migrations").run(pool),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Database migrations timed out after {}s", MIGRATION_TIMEOUT_SECS))?
    .map_err(|e| anyhow::anyhow!("Database migration failed: {}", e))?;

    Ok(())
}

/// Opens (creating if needed) the SQLite database behind `database_url` and migrates it.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    if let Some(path_str) = database_url.strip_prefix("sqlite:") {
        let path_str = path_str.trim_start_matches("//");
        if !path_str.starts_with(":memory:") {
            let db_path = std::path::Path::new(path_str);
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() && parent != std::path::Path::new(".") {
                    std::fs::create_dir_all(parent)?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
                    }
                    info!("📁 Data directory: {}", parent.display());
                }
            }
        }
    }

    let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;
    init_db(&pool).await?;
    Ok(pool)
}
