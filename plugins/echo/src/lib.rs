use async_trait::async_trait;
use relay_shared::{
    relay_agent, Agent, AgentContext, AgentMetadata, AgentRequest, AgentResponse, ChatTurn,
    LegacyAgent, LegacyRegistrar, LegacyReply,
};
use std::sync::Arc;

/// Diagnostics agent: answers with the prompt it received.
/// Useful for checking gateway wiring, rate limits and the breaker without an LLM.
#[relay_agent(
    name = "echo",
    version = "0.2.0",
    description = "Echoes the prompt back. Diagnostics only.",
    capabilities = ["echo", "diagnostics"],
    tier = "economy",
    tags = ["builtin", "diagnostics"]
)]
pub struct EchoAgent;

impl EchoAgent {
    pub async fn new_agent() -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn metadata(&self) -> AgentMetadata {
        self.auto_metadata()
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> anyhow::Result<AgentResponse> {
        tracing::debug!(prompt_len = request.prompt.len(), "🔁 Echo agent invoked");

        let mut data = serde_json::json!({
            "prompt": request.prompt,
            "history_len": request.history.len(),
        });
        if let Some(tenant) = context.get("tenant_id") {
            data["tenant_id"] = tenant.clone();
        }

        Ok(AgentResponse::success(request.prompt.clone())
            .with_data(data)
            .with_model("none"))
    }

    async fn validate_input(&self, request: &AgentRequest) -> anyhow::Result<bool> {
        Ok(!request.prompt.trim().is_empty())
    }
}

/// Old-style greeting responder kept on the `generate` interface.
pub struct Greeter;

#[async_trait]
impl LegacyAgent for Greeter {
    fn name(&self) -> &str {
        "greeter"
    }

    async fn generate(
        &self,
        prompt: &str,
        context: Option<&serde_json::Value>,
        history: &[ChatTurn],
        _use_cache: bool,
        _skip_guardrail: bool,
    ) -> anyhow::Result<LegacyReply> {
        let business = context
            .and_then(|c| c.get("business_name"))
            .and_then(|v| v.as_str())
            .unwrap_or("us");

        let text = if history.is_empty() {
            format!("Hello! Thanks for contacting {business}. You said: {prompt}")
        } else {
            format!("Welcome back! You said: {prompt}")
        };
        Ok(LegacyReply::text(text))
    }

    fn operations(&self) -> Vec<String> {
        vec!["greet".into(), "farewell".into()]
    }

    fn description(&self) -> Option<String> {
        Some("Greets customers on first contact".into())
    }
}

fn greeter() -> Arc<dyn LegacyAgent> {
    Arc::new(Greeter)
}

relay_shared::inventory::submit! {
    LegacyRegistrar { agent: greeter }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_prompt() {
        let agent = EchoAgent::new_agent().await.unwrap();
        let resp = agent
            .execute(&AgentRequest::new("ping"), &AgentContext::new())
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.message, "ping");
        assert_eq!(resp.data.unwrap()["prompt"], "ping");
    }

    #[tokio::test]
    async fn test_echo_rejects_blank_prompt() {
        let agent = EchoAgent;
        assert!(!agent.validate_input(&AgentRequest::new("   ")).await.unwrap());
        assert!(agent.validate_input(&AgentRequest::new("hi")).await.unwrap());
    }

    #[test]
    fn test_echo_metadata_from_macro() {
        let meta = EchoAgent.metadata();
        assert_eq!(meta.name, "echo");
        assert_eq!(meta.version, "0.2.0");
        assert!(meta.has_capability("diagnostics"));
        assert_eq!(meta.model_tier, relay_shared::ModelTier::Economy);
        assert_eq!(meta.channels.len(), 3);
    }

    #[tokio::test]
    async fn test_greeter_uses_business_name() {
        let reply = Greeter
            .generate("hi", Some(&serde_json::json!({"business_name": "Salon"})), &[], true, false)
            .await
            .unwrap();
        assert!(reply.text.contains("Salon"));
    }
}
