use anyhow::Context;
use chrono::{DateTime, Utc};
use relay_shared::{AgentContext, AgentRequest, AgentResponse, RelayError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::managers::AgentRegistry;
use crate::runtime_state::{AgentStatus, LimitType, RuntimeStateManager, StateKey};

pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Why a request never reached the agent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("agent is paused: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Paused { reason: Option<String> },
    #[error("circuit breaker open: {}", .reason.as_deref().unwrap_or("cooling down"))]
    CircuitOpen {
        remaining_seconds: Option<i64>,
        reason: Option<String>,
    },
    #[error("{limit_type} rate limit of {limit} reached, resets at {reset_at}")]
    RateLimited {
        limit_type: LimitType,
        limit: u32,
        reset_at: DateTime<Utc>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request rejected: {0}")]
    Rejected(Rejection),
    #[error(transparent)]
    Agent(#[from] RelayError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl DispatchError {
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

/// Per-tenant calling layer: status, breaker and rate-limit gates in front of
/// `AgentRegistry::execute`, with the outcome fed back into runtime state.
pub struct Gateway {
    registry: Arc<AgentRegistry>,
    states: Arc<RuntimeStateManager>,
    execution_timeout: Duration,
    failure_threshold: u32,
}

impl Gateway {
    pub fn new(registry: Arc<AgentRegistry>, states: Arc<RuntimeStateManager>) -> Self {
        Self {
            registry,
            states,
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn states(&self) -> &Arc<RuntimeStateManager> {
        &self.states
    }

    pub async fn dispatch(
        &self,
        tenant_id: &str,
        agent_name: &str,
        request: &AgentRequest,
        mut context: AgentContext,
        action_type: &str,
    ) -> Result<AgentResponse, DispatchError> {
        let key = StateKey::new(tenant_id, agent_name);
        let trace_id = uuid::Uuid::new_v4();

        // Unknown names never get a state document.
        self.registry.get(agent_name).await?;

        let state = self
            .states
            .get_or_initialize(&key)
            .await
            .with_context(|| format!("loading runtime state for {key}"))?;
        if state.status == AgentStatus::Paused {
            info!(tenant = %tenant_id, agent = %agent_name, %trace_id, "🔌 Agent is paused. Request dropped.");
            return Err(DispatchError::Rejected(Rejection::Paused {
                reason: state.status_reason,
            }));
        }

        let breaker = self.states.check_circuit_breaker(&key).await?;
        if !breaker.can_operate {
            warn!(
                tenant = %tenant_id,
                agent = %agent_name,
                %trace_id,
                remaining_seconds = ?breaker.remaining_seconds,
                "⚡ Request blocked by circuit breaker"
            );
            return Err(DispatchError::Rejected(Rejection::CircuitOpen {
                remaining_seconds: breaker.remaining_seconds,
                reason: breaker.reason,
            }));
        }

        for limit_type in [LimitType::Hourly, LimitType::Daily] {
            let check = self.states.check_rate_limit(&key, limit_type).await?;
            if !check.allowed {
                if breaker.testing {
                    self.states.release_test_pass(&key).await?;
                }
                return Err(DispatchError::Rejected(Rejection::RateLimited {
                    limit_type,
                    limit: check.limit,
                    reset_at: check.reset_at,
                }));
            }
        }

        context.insert("tenant_id".to_string(), serde_json::json!(tenant_id));
        context.insert("trace_id".to_string(), serde_json::json!(trace_id.to_string()));
        debug!(tenant = %tenant_id, agent = %agent_name, %trace_id, action = %action_type, "📢 Dispatching request");

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.execution_timeout,
            self.registry.execute(agent_name, request, &context),
        )
        .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(Ok(response)) => Ok(response),
            // Unregistered since the lookup above; nothing ran, nothing to record.
            Ok(Err(e)) if e.is_not_found() => {
                if breaker.testing {
                    self.states.release_test_pass(&key).await?;
                }
                return Err(DispatchError::Agent(e));
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.registry.update_metrics(agent_name, elapsed_ms, false).await;
                error!(tenant = %tenant_id, agent = %agent_name, %trace_id, "⏱️ Agent execution timed out");
                Err(RelayError::execution(
                    agent_name,
                    format!("timed out after {}s", self.execution_timeout.as_secs_f64()),
                ))
            }
        };

        let success = result.is_ok();
        let revenue = result.as_ref().map_or(0.0, revenue_of);
        let state = self
            .states
            .record_action(&key, action_type, success, revenue, elapsed_ms)
            .await?;

        match result {
            Ok(response) => {
                if breaker.testing {
                    self.states.reset_circuit_breaker(&key).await?;
                    info!(tenant = %tenant_id, agent = %agent_name, "✅ Test pass succeeded, circuit closed");
                }
                Ok(response)
            }
            Err(e) => {
                let failures = state.health.consecutive_failures;
                if breaker.testing || failures >= self.failure_threshold {
                    self.states
                        .trigger_circuit_breaker(&key, &e.to_string(), None)
                        .await?;
                }
                warn!(
                    tenant = %tenant_id,
                    agent = %agent_name,
                    %trace_id,
                    consecutive_failures = failures,
                    error = %e,
                    "❌ Dispatch failed"
                );
                Err(DispatchError::Agent(e))
            }
        }
    }
}

/// Revenue an agent attributes to the action via `data.revenue`.
fn revenue_of(response: &AgentResponse) -> f64 {
    response
        .data
        .as_ref()
        .and_then(|d| d.get("revenue"))
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0)
}
