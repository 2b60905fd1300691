//! Gateway dispatch: gates in front of the registry and the breaker feedback loop.

mod common;

use relay_core::db::StateStore;
use relay_core::gateway::{DispatchError, Rejection};
use relay_core::runtime_state::{AgentStateConfig, AgentStatus, BreakerState, LimitType, StateKey};
use relay_core::test_utils::create_test_gateway;
use relay_shared::{Agent, AgentContext, AgentRequest, RelayError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn instant_cooldown() -> AgentStateConfig {
    AgentStateConfig {
        cooldown_minutes: Some(0),
        ..AgentStateConfig::default()
    }
}

#[tokio::test]
async fn test_successful_dispatch_records_action() {
    use common::create_mock_agent;

    let (agent, calls) = create_mock_agent("booking");
    let received = agent.received.clone();
    let gateway = create_test_gateway(vec![agent as Arc<dyn Agent>], AgentStateConfig::default(), TIMEOUT, 3)
        .await
        .unwrap();

    let resp = gateway
        .dispatch("s1", "booking", &AgentRequest::new("book a haircut"), AgentContext::new(), "booking")
        .await
        .unwrap();
    assert_eq!(resp.message, "handled: book a haircut");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (_, ctx) = received.lock().await[0].clone();
    assert_eq!(ctx["tenant_id"], "s1");
    assert!(ctx.contains_key("trace_id"));

    let state = gateway
        .states()
        .get_agent_state(&StateKey::new("s1", "booking"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.counters.actions_taken, 1);
    assert_eq!(state.counters.by_type["booking"], 1);
    assert_eq!(state.rate_limits.hourly.current, 1);
}

#[tokio::test]
async fn test_paused_agent_is_rejected() {
    use common::create_mock_agent;

    let (agent, calls) = create_mock_agent("booking");
    let gateway = create_test_gateway(vec![agent as Arc<dyn Agent>], AgentStateConfig::default(), TIMEOUT, 3)
        .await
        .unwrap();
    let key = StateKey::new("s1", "booking");
    gateway
        .states()
        .update_status(&key, AgentStatus::Paused, Some("maintenance".into()))
        .await
        .unwrap();

    let err = gateway
        .dispatch("s1", "booking", &AgentRequest::new("x"), AgentContext::new(), "booking")
        .await
        .unwrap_err();
    assert_eq!(
        err.rejection(),
        Some(&Rejection::Paused { reason: Some("maintenance".into()) })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Another tenant is unaffected
    assert!(gateway
        .dispatch("s2", "booking", &AgentRequest::new("x"), AgentContext::new(), "booking")
        .await
        .is_ok());
}

#[tokio::test]
async fn test_rate_limit_rejects_before_execution() {
    use common::create_mock_agent;

    let (agent, calls) = create_mock_agent("booking");
    let gateway = create_test_gateway(
        vec![agent as Arc<dyn Agent>],
        AgentStateConfig::default().with_hourly_limit(1),
        TIMEOUT,
        3,
    )
    .await
    .unwrap();

    let req = AgentRequest::new("x");
    gateway.dispatch("s1", "booking", &req, AgentContext::new(), "booking").await.unwrap();
    let err = gateway
        .dispatch("s1", "booking", &req, AgentContext::new(), "booking")
        .await
        .unwrap_err();
    assert!(matches!(
        err.rejection(),
        Some(Rejection::RateLimited { limit_type: LimitType::Hourly, limit: 1, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    use common::create_slow_agent;

    let gateway = create_test_gateway(
        vec![create_slow_agent("slow", Duration::from_millis(500)) as Arc<dyn Agent>],
        AgentStateConfig::default(),
        Duration::from_millis(50),
        3,
    )
    .await
    .unwrap();

    let err = gateway
        .dispatch("s1", "slow", &AgentRequest::new("x"), AgentContext::new(), "lookup")
        .await
        .unwrap_err();
    match err {
        DispatchError::Agent(RelayError::Execution { message, .. }) => {
            assert!(message.contains("timed out"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    let metrics = gateway.registry().get_metrics("slow").await.unwrap();
    assert_eq!(metrics.error_count, 1);
    let state = gateway
        .states()
        .get_agent_state(&StateKey::new("s1", "slow"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.counters.actions_failed, 1);
    assert_eq!(state.health.consecutive_failures, 1);
    assert_eq!(state.circuit_breaker.state, BreakerState::Closed);
}

#[tokio::test]
async fn test_repeated_failures_open_breaker() {
    use common::create_failing_agent;

    let (agent, _) = create_failing_agent("waitlist", "calendar unavailable");
    let executions = agent.executions.clone();
    let gateway = create_test_gateway(vec![agent as Arc<dyn Agent>], AgentStateConfig::default(), TIMEOUT, 3)
        .await
        .unwrap();

    for _ in 0..3 {
        let err = gateway
            .dispatch("s1", "waitlist", &AgentRequest::new("x"), AgentContext::new(), "add")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Agent(_)));
    }

    let err = gateway
        .dispatch("s1", "waitlist", &AgentRequest::new("x"), AgentContext::new(), "add")
        .await
        .unwrap_err();
    assert!(matches!(err.rejection(), Some(Rejection::CircuitOpen { .. })));
    assert_eq!(executions.load(Ordering::SeqCst), 3);

    let state = gateway
        .states()
        .get_agent_state(&StateKey::new("s1", "waitlist"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, AgentStatus::CircuitBreaker);
    assert!(state
        .circuit_breaker
        .last_error
        .unwrap()
        .contains("calendar unavailable"));
}

#[tokio::test]
async fn test_half_open_success_closes_breaker() {
    use common::create_failing_agent;

    let (agent, healthy) = create_failing_agent("waitlist", "calendar unavailable");
    let gateway = create_test_gateway(vec![agent as Arc<dyn Agent>], instant_cooldown(), TIMEOUT, 1)
        .await
        .unwrap();
    let key = StateKey::new("s1", "waitlist");

    assert!(gateway
        .dispatch("s1", "waitlist", &AgentRequest::new("x"), AgentContext::new(), "add")
        .await
        .is_err());
    let state = gateway.states().get_agent_state(&key).await.unwrap().unwrap();
    assert_eq!(state.circuit_breaker.state, BreakerState::Open);

    healthy.store(true, Ordering::SeqCst);
    gateway
        .dispatch("s1", "waitlist", &AgentRequest::new("x"), AgentContext::new(), "add")
        .await
        .unwrap();

    let state = gateway.states().get_agent_state(&key).await.unwrap().unwrap();
    assert_eq!(state.circuit_breaker.state, BreakerState::Closed);
    assert_eq!(state.circuit_breaker.error_count, 0);
    assert_eq!(state.status, AgentStatus::Active);
}

#[tokio::test]
async fn test_half_open_failure_reopens_breaker() {
    use common::create_failing_agent;

    let (agent, _) = create_failing_agent("waitlist", "still down");
    let gateway = create_test_gateway(vec![agent as Arc<dyn Agent>], instant_cooldown(), TIMEOUT, 10)
        .await
        .unwrap();
    let key = StateKey::new("s1", "waitlist");
    gateway
        .states()
        .trigger_circuit_breaker(&key, "manual", None)
        .await
        .unwrap();

    // Below the threshold, but the failed test pass reopens the breaker
    assert!(gateway
        .dispatch("s1", "waitlist", &AgentRequest::new("x"), AgentContext::new(), "add")
        .await
        .is_err());

    let state = gateway.states().get_agent_state(&key).await.unwrap().unwrap();
    assert_eq!(state.circuit_breaker.state, BreakerState::Open);
    assert_eq!(state.circuit_breaker.error_count, 2);
}

#[tokio::test]
async fn test_unknown_agent_is_not_recorded() {
    let gateway = create_test_gateway(vec![], AgentStateConfig::default(), TIMEOUT, 1)
        .await
        .unwrap();

    let err = gateway
        .dispatch("s1", "ghost", &AgentRequest::new("x"), AgentContext::new(), "add")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Agent(RelayError::NotFound(_))));

    // No state document is created for names that never resolve
    let state = gateway
        .states()
        .get_agent_state(&StateKey::new("s1", "ghost"))
        .await
        .unwrap();
    assert!(state.is_none());
    assert!(gateway.states().list_tenant_states("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rate_limited_request_keeps_test_pass_available() {
    use chrono::{Duration as ChronoDuration, Utc};
    use common::create_failing_agent;

    let (agent, healthy) = create_failing_agent("waitlist", "calendar unavailable");
    let executions = agent.executions.clone();
    let gateway = create_test_gateway(
        vec![agent as Arc<dyn Agent>],
        instant_cooldown().with_hourly_limit(1),
        TIMEOUT,
        1,
    )
    .await
    .unwrap();
    let key = StateKey::new("s1", "waitlist");
    let req = AgentRequest::new("x");

    // Trips the breaker and uses up the hourly window
    assert!(gateway.dispatch("s1", "waitlist", &req, AgentContext::new(), "add").await.is_err());
    healthy.store(true, Ordering::SeqCst);

    let err = gateway
        .dispatch("s1", "waitlist", &req, AgentContext::new(), "add")
        .await
        .unwrap_err();
    assert!(matches!(
        err.rejection(),
        Some(Rejection::RateLimited { limit_type: LimitType::Hourly, .. })
    ));
    let state = gateway.states().get_agent_state(&key).await.unwrap().unwrap();
    assert_eq!(state.circuit_breaker.state, BreakerState::Open);
    assert!(state.circuit_breaker.testing_since.is_none());

    // Window rolls over
    let mut doc = state;
    doc.rate_limits.hourly.reset_at = Utc::now() - ChronoDuration::seconds(1);
    gateway.states().store().save_state(&doc).await.unwrap();

    gateway
        .dispatch("s1", "waitlist", &req, AgentContext::new(), "add")
        .await
        .unwrap();
    let state = gateway.states().get_agent_state(&key).await.unwrap().unwrap();
    assert_eq!(state.circuit_breaker.state, BreakerState::Closed);
    assert_eq!(state.status, AgentStatus::Active);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}
