use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ChatTurn;

/// Older agents expose a single `generate` entry point instead of the full
/// capability interface. The loader wraps them in an adapter.
#[async_trait]
pub trait LegacyAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        context: Option<&serde_json::Value>,
        history: &[ChatTurn],
        use_cache: bool,
        skip_guardrail: bool,
    ) -> anyhow::Result<LegacyReply>;

    /// Public operations besides `generate`. The adapter advertises the first few as capabilities.
    fn operations(&self) -> Vec<String> {
        Vec::new()
    }

    fn description(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyReply {
    pub text: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub model_used: Option<String>,
}

impl LegacyReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

pub struct LegacyRegistrar {
    pub agent: fn() -> Arc<dyn LegacyAgent>,
}

inventory::collect!(LegacyRegistrar);
