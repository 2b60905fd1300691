use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::runtime_state::AgentStateConfig;

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    /// Directory of `*.toml` agent descriptors. `None` disables the directory scan.
    pub plugin_dir: Option<PathBuf>,
    /// Upper bound on a single `agent.execute()` issued by the gateway.
    pub execution_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    pub default_hourly_limit: u32,
    pub default_daily_limit: u32,
    pub breaker_cooldown_minutes: u32,
    /// Consecutive failures on one (tenant, agent) before the gateway opens its breaker.
    pub breaker_failure_threshold: u32,
    pub auto_recovery: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let db_path = exe_dir().join("data").join("relay_state.db");
        Self {
            database_url: format!("sqlite:{}", db_path.display()),
            plugin_dir: None,
            execution_timeout_secs: 30,
            health_check_timeout_secs: 10,
            default_hourly_limit: 100,
            default_daily_limit: 1000,
            breaker_cooldown_minutes: 5,
            breaker_failure_threshold: 5,
            auto_recovery: true,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Failed to parse {key} (got '{raw}')")),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let database_url = env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let plugin_dir = env::var("RELAY_PLUGIN_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let execution_timeout_secs =
            env_or("RELAY_EXECUTION_TIMEOUT_SECS", defaults.execution_timeout_secs)?;
        if execution_timeout_secs == 0 || execution_timeout_secs > 300 {
            anyhow::bail!(
                "RELAY_EXECUTION_TIMEOUT_SECS must be between 1 and 300 (got {})",
                execution_timeout_secs
            );
        }

        let health_check_timeout_secs =
            env_or("RELAY_HEALTH_CHECK_TIMEOUT_SECS", defaults.health_check_timeout_secs)?;
        if health_check_timeout_secs == 0 || health_check_timeout_secs > 120 {
            anyhow::bail!(
                "RELAY_HEALTH_CHECK_TIMEOUT_SECS must be between 1 and 120 (got {})",
                health_check_timeout_secs
            );
        }

        let default_hourly_limit =
            env_or("RELAY_DEFAULT_HOURLY_LIMIT", defaults.default_hourly_limit)?;
        if default_hourly_limit == 0 {
            anyhow::bail!("RELAY_DEFAULT_HOURLY_LIMIT must be at least 1");
        }

        let default_daily_limit =
            env_or("RELAY_DEFAULT_DAILY_LIMIT", defaults.default_daily_limit)?;
        if default_daily_limit < default_hourly_limit {
            anyhow::bail!(
                "RELAY_DEFAULT_DAILY_LIMIT ({}) must not be lower than RELAY_DEFAULT_HOURLY_LIMIT ({})",
                default_daily_limit,
                default_hourly_limit
            );
        }

        let breaker_cooldown_minutes =
            env_or("RELAY_BREAKER_COOLDOWN_MINUTES", defaults.breaker_cooldown_minutes)?;
        if breaker_cooldown_minutes > 1440 {
            anyhow::bail!(
                "RELAY_BREAKER_COOLDOWN_MINUTES must be between 0 and 1440 (got {})",
                breaker_cooldown_minutes
            );
        }

        let breaker_failure_threshold =
            env_or("RELAY_BREAKER_FAILURE_THRESHOLD", defaults.breaker_failure_threshold)?;
        if breaker_failure_threshold == 0 || breaker_failure_threshold > 100 {
            anyhow::bail!(
                "RELAY_BREAKER_FAILURE_THRESHOLD must be between 1 and 100 (got {})",
                breaker_failure_threshold
            );
        }

        let auto_recovery = env_or("RELAY_AUTO_RECOVERY", defaults.auto_recovery)?;
        if !auto_recovery {
            tracing::warn!("Auto-recovery disabled: open circuit breakers require a manual reset");
        }

        Ok(Self {
            database_url,
            plugin_dir,
            execution_timeout_secs,
            health_check_timeout_secs,
            default_hourly_limit,
            default_daily_limit,
            breaker_cooldown_minutes,
            breaker_failure_threshold,
            auto_recovery,
        })
    }

    /// Runtime-state defaults applied when a (tenant, agent) key is first seen.
    #[must_use]
    pub fn state_defaults(&self) -> AgentStateConfig {
        AgentStateConfig {
            max_hourly_actions: Some(self.default_hourly_limit),
            max_daily_actions: Some(self.default_daily_limit),
            cooldown_minutes: Some(self.breaker_cooldown_minutes),
            auto_recovery: Some(self.auto_recovery),
        }
    }
}
