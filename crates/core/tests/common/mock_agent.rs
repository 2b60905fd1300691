use anyhow::Result;
use async_trait::async_trait;
use relay_shared::{
    Agent, AgentContext, AgentMetadata, AgentRequest, AgentResponse, Channel, ModelTier,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct MockAgent {
    pub metadata: AgentMetadata,
    pub executions: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<(AgentRequest, AgentContext)>>>,
    pub should_panic: bool,
    pub response_delay: Duration,
    /// Fail every call with this message.
    pub failure: Option<String>,
    /// Flipped at runtime to make a failing agent recover.
    pub healthy: Arc<AtomicBool>,
    pub accept_input: bool,
}

#[async_trait]
impl Agent for MockAgent {
    fn metadata(&self) -> AgentMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, request: &AgentRequest, context: &AgentContext) -> Result<AgentResponse> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.received.lock().await.push((request.clone(), context.clone()));
        assert!(!self.should_panic, "Intentional test panic");
        tokio::time::sleep(self.response_delay).await;
        if let Some(msg) = &self.failure {
            if !self.healthy.load(Ordering::SeqCst) {
                anyhow::bail!("{msg}");
            }
        }
        Ok(AgentResponse::success(format!("handled: {}", request.prompt))
            .with_model("mock"))
    }

    async fn validate_input(&self, _request: &AgentRequest) -> Result<bool> {
        Ok(self.accept_input)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

pub fn base_metadata(name: &str) -> AgentMetadata {
    AgentMetadata::new(name, "0.0.1", format!("Mock agent {name}"))
}

fn build(metadata: AgentMetadata) -> MockAgent {
    MockAgent {
        metadata,
        executions: Arc::new(AtomicUsize::new(0)),
        received: Arc::new(Mutex::new(Vec::new())),
        should_panic: false,
        response_delay: Duration::ZERO,
        failure: None,
        healthy: Arc::new(AtomicBool::new(true)),
        accept_input: true,
    }
}

/// Standard mock agent: counts executions, always succeeds.
pub fn create_mock_agent(name: &str) -> (Arc<MockAgent>, Arc<AtomicUsize>) {
    let agent = build(base_metadata(name));
    let executions = agent.executions.clone();
    (Arc::new(agent), executions)
}

/// Mock agent with explicit capabilities, tier and channels.
pub fn create_described_agent(
    name: &str,
    capabilities: &[&str],
    tier: ModelTier,
    channels: &[Channel],
) -> Arc<MockAgent> {
    let metadata = base_metadata(name)
        .with_capabilities(capabilities.iter().copied())
        .with_tier(tier)
        .with_channels(channels.iter().copied());
    Arc::new(build(metadata))
}

/// Slow mock agent: sleeps before answering.
pub fn create_slow_agent(name: &str, delay: Duration) -> Arc<MockAgent> {
    let mut agent = build(base_metadata(name));
    agent.response_delay = delay;
    Arc::new(agent)
}

/// Panics inside `execute`.
pub fn create_panicking_agent(name: &str) -> Arc<MockAgent> {
    let mut agent = build(base_metadata(name));
    agent.should_panic = true;
    Arc::new(agent)
}

/// Fails every execution until its `healthy` flag is set.
pub fn create_failing_agent(name: &str, message: &str) -> (Arc<MockAgent>, Arc<AtomicBool>) {
    let mut agent = build(base_metadata(name));
    agent.failure = Some(message.to_string());
    agent.healthy.store(false, Ordering::SeqCst);
    let healthy = agent.healthy.clone();
    (Arc::new(agent), healthy)
}

/// `validate_input` always returns false.
pub fn create_rejecting_agent(name: &str) -> (Arc<MockAgent>, Arc<AtomicUsize>) {
    let mut agent = build(base_metadata(name));
    agent.accept_input = false;
    let executions = agent.executions.clone();
    (Arc::new(agent), executions)
}
