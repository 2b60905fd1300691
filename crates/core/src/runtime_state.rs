//! Per-(tenant, agent) runtime state: status, circuit breaker, rate-limit
//! windows, daily counters and rolling health.
//!
//! `AgentRuntimeState` holds the pure state machine; every transition takes
//! `now` explicitly. `RuntimeStateManager` loads and persists documents
//! through a [`StateStore`] and serializes read-modify-write sequences per key.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::StateStore;

pub const DEFAULT_HOURLY_LIMIT: u32 = 100;
pub const DEFAULT_DAILY_LIMIT: u32 = 1000;
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 5;

/// How long a half-open test pass may stay unresolved before another caller
/// is allowed to take over the test.
const HALF_OPEN_LEASE_SECS: i64 = 600;

/// Composite key of a runtime-state document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub tenant_id: String,
    pub agent_name: String,
}

impl StateKey {
    pub fn new(tenant_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            agent_name: agent_name.into(),
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.agent_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Error,
    CircuitBreaker,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::CircuitBreaker => "circuit_breaker",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "circuit_breaker" => Ok(Self::CircuitBreaker),
            other => Err(anyhow::anyhow!("unknown agent status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: BreakerState,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub auto_recovery: bool,
    /// Start of the half-open test pass currently in flight, if any.
    #[serde(default)]
    pub testing_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCounters {
    pub date: NaiveDate,
    pub actions_taken: u64,
    pub actions_successful: u64,
    pub actions_failed: u64,
    pub revenue_generated: f64,
    #[serde(default)]
    pub by_type: BTreeMap<String, u64>,
}

impl ActionCounters {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            actions_taken: 0,
            actions_successful: 0,
            actions_failed: 0,
            revenue_generated: 0.0,
            by_type: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Hourly,
    Daily,
}

impl LimitType {
    fn window(self) -> ChronoDuration {
        match self {
            Self::Hourly => ChronoDuration::hours(1),
            Self::Daily => ChronoDuration::days(1),
        }
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        })
    }
}

impl std::str::FromStr for LimitType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(anyhow::anyhow!("unknown limit type '{}' (expected hourly|daily)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub limit: u32,
    pub current: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    pub hourly: RateWindow,
    pub daily: RateWindow,
}

impl RateLimits {
    fn window_mut(&mut self, limit_type: LimitType) -> &mut RateWindow {
        match limit_type {
            LimitType::Hourly => &mut self.hourly,
            LimitType::Daily => &mut self.daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub average_response_time_ms: f64,
    pub success_rate_24h: f64,
}

/// Overrides applied when a key is initialized. Unset fields fall back to the
/// manager's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStateConfig {
    pub max_hourly_actions: Option<u32>,
    pub max_daily_actions: Option<u32>,
    pub cooldown_minutes: Option<u32>,
    pub auto_recovery: Option<bool>,
}

impl AgentStateConfig {
    #[must_use]
    pub fn with_hourly_limit(mut self, limit: u32) -> Self {
        self.max_hourly_actions = Some(limit);
        self
    }

    #[must_use]
    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.max_daily_actions = Some(limit);
        self
    }

    #[must_use]
    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery = Some(enabled);
        self
    }

    /// Fill unset fields from `fallback`.
    #[must_use]
    pub fn merged_over(&self, fallback: &AgentStateConfig) -> AgentStateConfig {
        AgentStateConfig {
            max_hourly_actions: self.max_hourly_actions.or(fallback.max_hourly_actions),
            max_daily_actions: self.max_daily_actions.or(fallback.max_daily_actions),
            cooldown_minutes: self.cooldown_minutes.or(fallback.cooldown_minutes),
            auto_recovery: self.auto_recovery.or(fallback.auto_recovery),
        }
    }
}

/// Outcome of `check_circuit_breaker`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerCheck {
    pub can_operate: bool,
    pub state: BreakerState,
    /// True when this caller holds the single half-open test pass.
    pub testing: bool,
    pub remaining_seconds: Option<i64>,
    pub reason: Option<String>,
}

/// Outcome of `check_rate_limit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitCheck {
    pub limit_type: LimitType,
    pub allowed: bool,
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntimeState {
    pub tenant_id: String,
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    pub status_changed_at: DateTime<Utc>,
    pub circuit_breaker: CircuitBreaker,
    pub counters: ActionCounters,
    pub rate_limits: RateLimits,
    pub health: HealthStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRuntimeState {
    pub fn new(key: &StateKey, config: &AgentStateConfig, now: DateTime<Utc>) -> Self {
        let hourly = config.max_hourly_actions.unwrap_or(DEFAULT_HOURLY_LIMIT);
        let daily = config.max_daily_actions.unwrap_or(DEFAULT_DAILY_LIMIT);
        Self {
            tenant_id: key.tenant_id.clone(),
            agent_name: key.agent_name.clone(),
            status: AgentStatus::Active,
            status_reason: None,
            status_changed_at: now,
            circuit_breaker: CircuitBreaker {
                state: BreakerState::Closed,
                error_count: 0,
                last_error: None,
                last_error_time: None,
                cooldown_until: None,
                auto_recovery: config.auto_recovery.unwrap_or(true),
                testing_since: None,
            },
            counters: ActionCounters::empty(now.date_naive()),
            rate_limits: RateLimits {
                hourly: RateWindow {
                    limit: hourly,
                    current: 0,
                    reset_at: now + LimitType::Hourly.window(),
                },
                daily: RateWindow {
                    limit: daily,
                    current: 0,
                    reset_at: now + LimitType::Daily.window(),
                },
            },
            health: HealthStats {
                last_heartbeat: None,
                consecutive_failures: 0,
                average_response_time_ms: 0.0,
                success_rate_24h: 1.0,
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn key(&self) -> StateKey {
        StateKey::new(&self.tenant_id, &self.agent_name)
    }

    pub fn update_status(&mut self, status: AgentStatus, reason: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.status_reason = reason;
        self.status_changed_at = now;
        self.updated_at = now;
    }

    /// Evaluates the breaker, moving OPEN to HALF_OPEN once the cooldown has
    /// elapsed and auto-recovery is on.
    pub fn check_circuit_breaker(&mut self, now: DateTime<Utc>) -> BreakerCheck {
        let cb = &mut self.circuit_breaker;
        match cb.state {
            BreakerState::Closed => BreakerCheck {
                can_operate: true,
                state: BreakerState::Closed,
                testing: false,
                remaining_seconds: None,
                reason: None,
            },
            BreakerState::Open => {
                if let Some(until) = cb.cooldown_until {
                    if now < until {
                        return BreakerCheck {
                            can_operate: false,
                            state: BreakerState::Open,
                            testing: false,
                            remaining_seconds: Some((until - now).num_seconds().max(1)),
                            reason: Some("circuit breaker open, cooling down".to_string()),
                        };
                    }
                }

                if !cb.auto_recovery {
                    return BreakerCheck {
                        can_operate: false,
                        state: BreakerState::Open,
                        testing: false,
                        remaining_seconds: None,
                        reason: Some("circuit breaker open, manual reset required".to_string()),
                    };
                }

                cb.state = BreakerState::HalfOpen;
                cb.testing_since = Some(now);
                self.updated_at = now;
                BreakerCheck {
                    can_operate: true,
                    state: BreakerState::HalfOpen,
                    testing: true,
                    remaining_seconds: None,
                    reason: None,
                }
            }
            BreakerState::HalfOpen => {
                let lease_end = cb
                    .testing_since
                    .map(|since| since + ChronoDuration::seconds(HALF_OPEN_LEASE_SECS));
                match lease_end {
                    Some(end) if now < end => BreakerCheck {
                        can_operate: false,
                        state: BreakerState::HalfOpen,
                        testing: false,
                        remaining_seconds: Some((end - now).num_seconds().max(1)),
                        reason: Some("circuit breaker half-open, test pass in progress".to_string()),
                    },
                    _ => {
                        // The previous test pass never reported back.
                        cb.testing_since = Some(now);
                        self.updated_at = now;
                        BreakerCheck {
                            can_operate: true,
                            state: BreakerState::HalfOpen,
                            testing: true,
                            remaining_seconds: None,
                            reason: None,
                        }
                    }
                }
            }
        }
    }

    pub fn trigger_circuit_breaker(&mut self, error: &str, cooldown_minutes: u32, now: DateTime<Utc>) {
        let cb = &mut self.circuit_breaker;
        cb.state = BreakerState::Open;
        cb.error_count = cb.error_count.saturating_add(1);
        cb.last_error = Some(error.to_string());
        cb.last_error_time = Some(now);
        cb.cooldown_until = Some(now + ChronoDuration::minutes(i64::from(cooldown_minutes)));
        cb.testing_since = None;
        self.update_status(AgentStatus::CircuitBreaker, Some(error.to_string()), now);
    }

    /// Hands back an unused half-open test pass. The breaker returns to OPEN
    /// with its cooldown already elapsed, so the next check grants a new pass.
    pub fn release_test_pass(&mut self, now: DateTime<Utc>) -> bool {
        let cb = &mut self.circuit_breaker;
        if cb.state != BreakerState::HalfOpen || cb.testing_since.is_none() {
            return false;
        }
        cb.state = BreakerState::Open;
        cb.cooldown_until = Some(now);
        cb.testing_since = None;
        self.updated_at = now;
        true
    }

    pub fn reset_circuit_breaker(&mut self, now: DateTime<Utc>) {
        let cb = &mut self.circuit_breaker;
        cb.state = BreakerState::Closed;
        cb.error_count = 0;
        cb.cooldown_until = None;
        cb.testing_since = None;
        self.health.consecutive_failures = 0;
        self.update_status(AgentStatus::Active, None, now);
    }

    /// Resets the window when `now >= reset_at`. Returns true if it did.
    pub fn roll_window(&mut self, limit_type: LimitType, now: DateTime<Utc>) -> bool {
        let window = self.rate_limits.window_mut(limit_type);
        if now >= window.reset_at {
            window.current = 0;
            window.reset_at = now + limit_type.window();
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn rate_limit_status(&self, limit_type: LimitType) -> RateLimitCheck {
        let window = match limit_type {
            LimitType::Hourly => &self.rate_limits.hourly,
            LimitType::Daily => &self.rate_limits.daily,
        };
        RateLimitCheck {
            limit_type,
            allowed: window.current < window.limit,
            current: window.current,
            limit: window.limit,
            remaining: window.limit.saturating_sub(window.current),
            reset_at: window.reset_at,
        }
    }

    pub fn record_action(
        &mut self,
        action_type: &str,
        success: bool,
        revenue: f64,
        response_time_ms: u64,
        now: DateTime<Utc>,
    ) {
        let today = now.date_naive();
        if self.counters.date != today {
            self.counters = ActionCounters::empty(today);
        }

        let c = &mut self.counters;
        c.actions_taken += 1;
        if success {
            c.actions_successful += 1;
            if revenue.is_finite() {
                c.revenue_generated += revenue;
            }
        } else {
            c.actions_failed += 1;
        }
        *c.by_type.entry(action_type.to_string()).or_insert(0) += 1;

        let limits = &mut self.rate_limits;
        limits.hourly.current = limits.hourly.current.saturating_add(1);
        limits.daily.current = limits.daily.current.saturating_add(1);

        let h = &mut self.health;
        h.last_heartbeat = Some(now);
        if success {
            h.consecutive_failures = 0;
        } else {
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        }
        let n = c.actions_taken as f64;
        h.average_response_time_ms += (response_time_ms as f64 - h.average_response_time_ms) / n;
        h.success_rate_24h = c.actions_successful as f64 / n;

        self.updated_at = now;
    }
}

/// Loads, mutates and persists runtime-state documents.
pub struct RuntimeStateManager {
    store: Arc<dyn StateStore>,
    defaults: AgentStateConfig,
    locks: DashMap<StateKey, (Arc<Mutex<()>>, std::time::Instant)>,
}

impl RuntimeStateManager {
    pub fn new(store: Arc<dyn StateStore>, defaults: AgentStateConfig) -> Self {
        Self {
            store,
            defaults,
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    #[must_use]
    pub fn defaults(&self) -> &AgentStateConfig {
        &self.defaults
    }

    fn key_lock(&self, key: &StateKey) -> Arc<Mutex<()>> {
        let mut entry = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| (Arc::new(Mutex::new(())), std::time::Instant::now()));
        entry.1 = std::time::Instant::now();
        entry.0.clone()
    }

    /// Drop lock entries idle for ten minutes that nobody is holding.
    pub fn cleanup(&self) {
        let idle_threshold = std::time::Duration::from_secs(600);
        self.locks.retain(|_, (lock, last_seen)| {
            Arc::strong_count(lock) > 1 || last_seen.elapsed() < idle_threshold
        });
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }

    /// `Ok(None)` means the key was never initialized.
    pub async fn get_agent_state(&self, key: &StateKey) -> anyhow::Result<Option<AgentRuntimeState>> {
        self.store.load_state(key).await
    }

    /// Creates the document if absent. An existing document is returned unchanged.
    pub async fn initialize_agent_state(
        &self,
        key: &StateKey,
        config: &AgentStateConfig,
    ) -> anyhow::Result<AgentRuntimeState> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.load_or_create(key, config).await
    }

    pub async fn get_or_initialize(&self, key: &StateKey) -> anyhow::Result<AgentRuntimeState> {
        self.initialize_agent_state(key, &AgentStateConfig::default()).await
    }

    async fn load_or_create(
        &self,
        key: &StateKey,
        config: &AgentStateConfig,
    ) -> anyhow::Result<AgentRuntimeState> {
        if let Some(existing) = self.store.load_state(key).await? {
            return Ok(existing);
        }
        let resolved = config.merged_over(&self.defaults);
        let state = AgentRuntimeState::new(key, &resolved, Utc::now());
        self.store.save_state(&state).await?;
        info!(
            tenant = %key.tenant_id,
            agent = %key.agent_name,
            hourly_limit = state.rate_limits.hourly.limit,
            daily_limit = state.rate_limits.daily.limit,
            "🆕 Initialized agent runtime state"
        );
        Ok(state)
    }

    /// Runs `f` on the key's state under its lock. The document is saved when
    /// `f` returns `true` in the second tuple slot.
    async fn mutate<R>(
        &self,
        key: &StateKey,
        f: impl FnOnce(&mut AgentRuntimeState, DateTime<Utc>) -> (R, bool),
    ) -> anyhow::Result<(R, AgentRuntimeState)> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut state = self.load_or_create(key, &AgentStateConfig::default()).await?;
        let (out, dirty) = f(&mut state, Utc::now());
        if dirty {
            self.store.save_state(&state).await?;
        }
        Ok((out, state))
    }

    pub async fn update_status(
        &self,
        key: &StateKey,
        status: AgentStatus,
        reason: Option<String>,
    ) -> anyhow::Result<AgentRuntimeState> {
        let ((), state) = self
            .mutate(key, |s, now| {
                s.update_status(status, reason, now);
                ((), true)
            })
            .await?;
        info!(tenant = %key.tenant_id, agent = %key.agent_name, status = %status, "🔀 Agent status changed");
        Ok(state)
    }

    pub async fn record_action(
        &self,
        key: &StateKey,
        action_type: &str,
        success: bool,
        revenue: f64,
        response_time_ms: u64,
    ) -> anyhow::Result<AgentRuntimeState> {
        let ((), state) = self
            .mutate(key, |s, now| {
                s.record_action(action_type, success, revenue, response_time_ms, now);
                ((), true)
            })
            .await?;
        Ok(state)
    }

    pub async fn check_rate_limit(
        &self,
        key: &StateKey,
        limit_type: LimitType,
    ) -> anyhow::Result<RateLimitCheck> {
        let (check, _) = self
            .mutate(key, |s, now| {
                let rolled = s.roll_window(limit_type, now);
                (s.rate_limit_status(limit_type), rolled)
            })
            .await?;
        if !check.allowed {
            warn!(
                tenant = %key.tenant_id,
                agent = %key.agent_name,
                limit_type = %limit_type,
                limit = check.limit,
                "🚦 Rate limit reached"
            );
        }
        Ok(check)
    }

    pub async fn trigger_circuit_breaker(
        &self,
        key: &StateKey,
        error: &str,
        cooldown_minutes: Option<u32>,
    ) -> anyhow::Result<AgentRuntimeState> {
        let cooldown = cooldown_minutes
            .or(self.defaults.cooldown_minutes)
            .unwrap_or(DEFAULT_COOLDOWN_MINUTES);
        let ((), state) = self
            .mutate(key, |s, now| {
                s.trigger_circuit_breaker(error, cooldown, now);
                ((), true)
            })
            .await?;
        warn!(
            tenant = %key.tenant_id,
            agent = %key.agent_name,
            error = %error,
            cooldown_minutes = cooldown,
            error_count = state.circuit_breaker.error_count,
            "⚡ Circuit breaker opened"
        );
        Ok(state)
    }

    pub async fn check_circuit_breaker(&self, key: &StateKey) -> anyhow::Result<BreakerCheck> {
        let (check, _) = self
            .mutate(key, |s, now| {
                let before = s.circuit_breaker.clone();
                let check = s.check_circuit_breaker(now);
                let changed = before != s.circuit_breaker;
                (check, changed)
            })
            .await?;
        if check.testing {
            info!(tenant = %key.tenant_id, agent = %key.agent_name, "🧪 Circuit breaker half-open, allowing test pass");
        }
        Ok(check)
    }

    /// Returns a half-open test pass that was granted but never used.
    pub async fn release_test_pass(&self, key: &StateKey) -> anyhow::Result<bool> {
        let (released, _) = self
            .mutate(key, |s, now| {
                let released = s.release_test_pass(now);
                (released, released)
            })
            .await?;
        if released {
            debug!(tenant = %key.tenant_id, agent = %key.agent_name, "🧪 Unused test pass released");
        }
        Ok(released)
    }

    pub async fn reset_circuit_breaker(&self, key: &StateKey) -> anyhow::Result<AgentRuntimeState> {
        let ((), state) = self
            .mutate(key, |s, now| {
                s.reset_circuit_breaker(now);
                ((), true)
            })
            .await?;
        info!(tenant = %key.tenant_id, agent = %key.agent_name, "✅ Circuit breaker reset");
        Ok(state)
    }

    pub async fn list_tenant_states(&self, tenant_id: &str) -> anyhow::Result<Vec<AgentRuntimeState>> {
        self.store.list_tenant_states(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(now: DateTime<Utc>) -> AgentRuntimeState {
        AgentRuntimeState::new(&StateKey::new("s1", "waitlist"), &AgentStateConfig::default(), now)
    }

    #[test]
    fn test_new_state_defaults() {
        let now = Utc::now();
        let s = fresh(now);
        assert_eq!(s.status, AgentStatus::Active);
        assert_eq!(s.circuit_breaker.state, BreakerState::Closed);
        assert!(s.circuit_breaker.auto_recovery);
        assert_eq!(s.rate_limits.hourly.limit, DEFAULT_HOURLY_LIMIT);
        assert_eq!(s.rate_limits.daily.reset_at, now + ChronoDuration::days(1));
    }

    #[test]
    fn test_record_action_counts() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.record_action("booking", true, 25.0, 100, now);
        s.record_action("booking", false, 99.0, 300, now);
        s.record_action("reminder", true, 0.0, 200, now);

        assert_eq!(s.counters.actions_taken, 3);
        assert_eq!(s.counters.actions_successful + s.counters.actions_failed, 3);
        assert_eq!(s.counters.revenue_generated, 25.0);
        assert_eq!(s.counters.by_type["booking"], 2);
        assert_eq!(s.rate_limits.hourly.current, 3);
        assert_eq!(s.rate_limits.daily.current, 3);
        assert!((s.health.average_response_time_ms - 200.0).abs() < f64::EPSILON);
        assert!((s.health.success_rate_24h - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.health.consecutive_failures, 0);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.record_action("x", false, 0.0, 10, now);
        s.record_action("x", false, 0.0, 10, now);
        assert_eq!(s.health.consecutive_failures, 2);
        s.record_action("x", true, 0.0, 10, now);
        assert_eq!(s.health.consecutive_failures, 0);
    }

    #[test]
    fn test_counters_roll_over_on_new_day() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.record_action("x", true, 5.0, 10, now);
        let tomorrow = now + ChronoDuration::days(1);
        s.record_action("y", false, 0.0, 10, tomorrow);
        assert_eq!(s.counters.date, tomorrow.date_naive());
        assert_eq!(s.counters.actions_taken, 1);
        assert_eq!(s.counters.actions_failed, 1);
        assert_eq!(s.counters.revenue_generated, 0.0);
        assert!(!s.counters.by_type.contains_key("x"));
    }

    #[test]
    fn test_rate_window_resets_once_reset_at_passes() {
        let now = Utc::now();
        let mut s = AgentRuntimeState::new(
            &StateKey::new("s1", "a"),
            &AgentStateConfig::default().with_hourly_limit(2),
            now,
        );
        s.record_action("x", true, 0.0, 1, now);
        s.record_action("x", true, 0.0, 1, now);
        assert!(!s.roll_window(LimitType::Hourly, now));
        let check = s.rate_limit_status(LimitType::Hourly);
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);

        let later = s.rate_limits.hourly.reset_at;
        assert!(s.roll_window(LimitType::Hourly, later));
        let check = s.rate_limit_status(LimitType::Hourly);
        assert!(check.allowed);
        assert_eq!(check.current, 0);
        assert_eq!(check.reset_at, later + ChronoDuration::hours(1));
        // daily window untouched
        assert_eq!(s.rate_limits.daily.current, 2);
    }

    #[test]
    fn test_breaker_open_then_half_open_after_cooldown() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.trigger_circuit_breaker("upstream 500", 5, now);
        assert_eq!(s.status, AgentStatus::CircuitBreaker);
        assert_eq!(s.circuit_breaker.error_count, 1);

        let check = s.check_circuit_breaker(now + ChronoDuration::minutes(1));
        assert!(!check.can_operate);
        assert_eq!(check.state, BreakerState::Open);
        assert_eq!(check.remaining_seconds, Some(240));

        let check = s.check_circuit_breaker(now + ChronoDuration::minutes(5));
        assert!(check.can_operate);
        assert!(check.testing);
        assert_eq!(check.state, BreakerState::HalfOpen);
        assert_eq!(s.circuit_breaker.state, BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_test_pass() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.trigger_circuit_breaker("boom", 0, now);
        assert!(s.check_circuit_breaker(now).testing);

        let second = s.check_circuit_breaker(now + ChronoDuration::seconds(1));
        assert!(!second.can_operate);
        assert_eq!(second.state, BreakerState::HalfOpen);

        // abandoned test pass is handed to the next caller after the lease
        let later = now + ChronoDuration::seconds(HALF_OPEN_LEASE_SECS + 1);
        assert!(s.check_circuit_breaker(later).testing);
    }

    #[test]
    fn test_released_test_pass_is_granted_again() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.trigger_circuit_breaker("boom", 0, now);
        assert!(s.check_circuit_breaker(now).testing);

        assert!(s.release_test_pass(now));
        assert_eq!(s.circuit_breaker.state, BreakerState::Open);
        assert!(!s.release_test_pass(now));

        let again = s.check_circuit_breaker(now + ChronoDuration::seconds(1));
        assert!(again.can_operate);
        assert!(again.testing);
    }

    #[test]
    fn test_breaker_without_auto_recovery_stays_closed_to_work() {
        let now = Utc::now();
        let mut s = AgentRuntimeState::new(
            &StateKey::new("s1", "a"),
            &AgentStateConfig::default().with_auto_recovery(false),
            now,
        );
        s.trigger_circuit_breaker("boom", 1, now);
        let check = s.check_circuit_breaker(now + ChronoDuration::hours(3));
        assert!(!check.can_operate);
        assert_eq!(check.state, BreakerState::Open);
    }

    #[test]
    fn test_reset_forces_closed_and_active() {
        let now = Utc::now();
        let mut s = fresh(now);
        s.update_status(AgentStatus::Paused, Some("maintenance".into()), now);
        s.record_action("x", false, 0.0, 1, now);
        s.trigger_circuit_breaker("boom", 5, now);
        s.trigger_circuit_breaker("boom again", 5, now);
        s.reset_circuit_breaker(now);

        assert_eq!(s.status, AgentStatus::Active);
        assert!(s.status_reason.is_none());
        assert_eq!(s.circuit_breaker.state, BreakerState::Closed);
        assert_eq!(s.circuit_breaker.error_count, 0);
        assert_eq!(s.health.consecutive_failures, 0);
        assert_eq!(s.circuit_breaker.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_config_merge_prefers_explicit_values() {
        let defaults = AgentStateConfig {
            max_hourly_actions: Some(100),
            max_daily_actions: Some(1000),
            cooldown_minutes: Some(5),
            auto_recovery: Some(true),
        };
        let merged = AgentStateConfig::default().with_hourly_limit(2).merged_over(&defaults);
        assert_eq!(merged.max_hourly_actions, Some(2));
        assert_eq!(merged.max_daily_actions, Some(1000));
    }

    #[test]
    fn test_status_and_limit_type_parse() {
        assert_eq!("circuit_breaker".parse::<AgentStatus>().unwrap(), AgentStatus::CircuitBreaker);
        assert_eq!("Hourly".parse::<LimitType>().unwrap(), LimitType::Hourly);
        assert!("weekly".parse::<LimitType>().is_err());
    }

    #[test]
    fn test_state_serde_snake_case() {
        let s = fresh(Utc::now());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["circuit_breaker"]["state"], "closed");
        let back: AgentRuntimeState = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
