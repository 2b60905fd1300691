//! Agents backed by a child process speaking newline-delimited JSON-RPC over
//! stdio. Requests are `{"id", "method", "params"}`; replies carry either
//! `result` or `error`.

pub mod descriptor;
mod ipc;
mod process;
mod state;

use async_trait::async_trait;
use relay_shared::{Agent, AgentContext, AgentMetadata, AgentRequest, AgentResponse, RelayError};
use std::sync::Arc;
use tokio::sync::RwLock;

pub use descriptor::{parse_descriptor, read_descriptor, AgentDescriptor, HookFlags};
use state::BridgeState;

pub struct BridgeAgent {
    pub(crate) descriptor: AgentDescriptor,
    metadata: AgentMetadata,
    pub(crate) state: Arc<RwLock<BridgeState>>,
}

impl BridgeAgent {
    /// The process is not started until the first call.
    pub fn new(descriptor: AgentDescriptor) -> Self {
        let metadata = descriptor.metadata();
        Self {
            descriptor,
            metadata,
            state: Arc::new(RwLock::new(BridgeState::new())),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.process.is_some()
    }

    fn execution_error(&self, err: anyhow::Error) -> anyhow::Error {
        RelayError::execution(&self.descriptor.name, err.to_string()).into()
    }
}

#[async_trait]
impl Agent for BridgeAgent {
    fn metadata(&self) -> AgentMetadata {
        self.metadata.clone()
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> anyhow::Result<AgentResponse> {
        let params = serde_json::json!({ "request": request, "context": context });
        let result = self.call("execute", params).await.map_err(|e| self.execution_error(e))?;
        serde_json::from_value(result).map_err(|e| {
            RelayError::execution(&self.descriptor.name, format!("malformed execute reply: {e}")).into()
        })
    }

    async fn validate_input(&self, request: &AgentRequest) -> anyhow::Result<bool> {
        if !self.descriptor.hooks.validate_input {
            return Ok(true);
        }
        let result = self
            .call("validate_input", serde_json::json!({ "request": request }))
            .await
            .map_err(|e| self.execution_error(e))?;
        result
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("validate_input returned non-bool: {}", result))
    }

    async fn post_process(&self, response: AgentResponse) -> anyhow::Result<AgentResponse> {
        if !self.descriptor.hooks.post_process {
            return Ok(response);
        }
        let result = self
            .call("post_process", serde_json::json!({ "response": response }))
            .await
            .map_err(|e| self.execution_error(e))?;
        Ok(serde_json::from_value(result)?)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        if self.descriptor.hooks.health_check {
            let result = self.call("health_check", serde_json::Value::Null).await?;
            return Ok(result.as_bool().unwrap_or(false));
        }
        // Without a health hook, a live (or spawnable) process counts as healthy.
        self.ensure_process().await?;
        Ok(true)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    // Replies to every request with a fixed response, echoing the id back.
    const PONG: &str = r#"
[[agents]]
name = "pong"
command = "sh"
args = ["-c", '''
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -e 's/^{"id":\([0-9]*\),.*/\1/')
  printf '{"id":%s,"result":{"success":true,"message":"pong"}}\n' "$id"
done
''']
call_timeout_secs = 5
"#;

    #[tokio::test]
    async fn test_execute_round_trip() {
        let d = parse_descriptor(Path::new("pong.toml"), PONG).unwrap().remove(0);
        let agent = BridgeAgent::new(d);
        assert!(!agent.is_running().await);

        let resp = agent
            .execute(&AgentRequest::new("ping"), &AgentContext::new())
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.message, "pong");
        assert!(agent.is_running().await);

        // Disabled hooks never reach the process
        assert!(agent.validate_input(&AgentRequest::new("")).await.unwrap());

        agent.shutdown().await;
        assert!(!agent.is_running().await);
        let err = agent.execute(&AgentRequest::new("ping"), &AgentContext::new()).await.unwrap_err();
        let relay = err.downcast_ref::<RelayError>().unwrap();
        assert!(relay.is_execution());
    }
}
