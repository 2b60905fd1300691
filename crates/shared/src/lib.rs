use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod agent;
mod legacy;

pub use agent::*;
pub use legacy::{LegacyAgent, LegacyRegistrar, LegacyReply};

pub use inventory;
pub use relay_macros::relay_agent;

/// SDK version reported by compiled-in agents that do not declare their own.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum RelayError {
    #[error("Agent '{agent}' execution failed: {message}")]
    Execution {
        agent: String,
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("Agent '{agent}' rejected input: {message}")]
    Validation { agent: String, message: String },
    #[error("Agent not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn execution(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            agent: agent.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Attach structured details. Only meaningful for `Execution`; other variants are returned as-is.
    #[must_use]
    pub fn with_details(self, value: serde_json::Value) -> Self {
        match self {
            Self::Execution { agent, message, .. } => Self::Execution {
                agent,
                message,
                details: Some(value),
            },
            other => other,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// The capability interface every agent implementation satisfies.
///
/// Only `metadata` and `execute` are required. The remaining hooks default to
/// "accept everything", identity post-processing and "always healthy".
#[async_trait]
pub trait Agent: Send + Sync {
    fn metadata(&self) -> AgentMetadata;

    /// Run the agent. Failures are reported as errors, never as `success: false`.
    async fn execute(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> anyhow::Result<AgentResponse>;

    async fn validate_input(&self, _request: &AgentRequest) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn post_process(&self, response: AgentResponse) -> anyhow::Result<AgentResponse> {
        Ok(response)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// One-time warm-up hook, called by `AgentRegistry::initialize_all`.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds agent instances for the loader. Compiled-in agents get one generated by `#[relay_agent]`.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    fn name(&self) -> &str;
    async fn create(&self) -> anyhow::Result<Arc<dyn Agent>>;
}

pub struct AgentRegistrar {
    pub factory: fn() -> Arc<dyn AgentFactory>,
}

inventory::collect!(AgentRegistrar);
