use async_trait::async_trait;
use relay_shared::{
    Agent, AgentContext, AgentMetadata, AgentRequest, AgentResponse, LegacyAgent, LegacyReply,
    ModelTier,
};
use std::sync::Arc;

/// How many of a legacy agent's operations are advertised as capabilities.
const MAX_DERIVED_CAPABILITIES: usize = 5;

/// Presents a `generate`-style legacy agent through the `Agent` interface.
pub struct LegacyAdapter {
    inner: Arc<dyn LegacyAgent>,
    metadata: AgentMetadata,
}

impl LegacyAdapter {
    pub fn new(inner: Arc<dyn LegacyAgent>) -> Self {
        let name = inner.name().to_string();
        let description = inner
            .description()
            .unwrap_or_else(|| format!("Legacy agent adapter for {name}"));
        let capabilities: Vec<String> = inner
            .operations()
            .into_iter()
            .filter(|op| !op.starts_with('_') && op != "generate")
            .take(MAX_DERIVED_CAPABILITIES)
            .collect();

        let metadata = AgentMetadata::new(name, "1.0.0", description)
            .with_capabilities(capabilities)
            .with_tier(ModelTier::Standard)
            .with_tags(["legacy"]);

        Self { inner, metadata }
    }
}

/// Legacy agents take a single context value; fall back to the dispatch
/// context when the request carries none.
fn legacy_context(request: &AgentRequest, context: &AgentContext) -> Option<serde_json::Value> {
    if let Some(ctx) = &request.context {
        return Some(ctx.clone());
    }
    if context.is_empty() {
        return None;
    }
    Some(serde_json::Value::Object(
        context.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))
}

fn into_response(reply: LegacyReply) -> AgentResponse {
    let mut response = if reply.blocked {
        AgentResponse::blocked(reply.text)
    } else {
        AgentResponse::success(reply.text)
    };
    response.data = reply.data;
    response.cached = reply.cached;
    response.model_used = reply.model_used;
    response
}

#[async_trait]
impl Agent for LegacyAdapter {
    fn metadata(&self) -> AgentMetadata {
        self.metadata.clone()
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> anyhow::Result<AgentResponse> {
        let ctx = legacy_context(request, context);
        let reply = self
            .inner
            .generate(
                &request.prompt,
                ctx.as_ref(),
                &request.history,
                request.use_cache,
                request.skip_guardrail,
            )
            .await?;
        Ok(into_response(reply))
    }
}
