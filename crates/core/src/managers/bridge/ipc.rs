use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};

use super::BridgeAgent;

/// Writes one newline-delimited JSON request.
pub(crate) async fn send_raw(
    stdin: &mut tokio::process::ChildStdin,
    id: u64,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<()> {
    let request = serde_json::json!({
        "id": id,
        "method": method,
        "params": params
    });
    let mut line = request.to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

impl BridgeAgent {
    pub(crate) const MAX_PENDING_CALLS: usize = 50;

    /// One request/response round-trip with the agent process.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.ensure_process().await?;

        // Registration and send under one lock so the reply cannot race ahead.
        let (id, rx) = {
            let mut state = self.state.write().await;
            if state.pending_calls.len() >= Self::MAX_PENDING_CALLS {
                tracing::warn!(
                    agent = %self.descriptor.name,
                    "Pending call limit reached: {}/{}",
                    state.pending_calls.len(),
                    Self::MAX_PENDING_CALLS
                );
                return Err(anyhow::anyhow!(
                    "Agent '{}' pending call limit reached ({})",
                    self.descriptor.name,
                    Self::MAX_PENDING_CALLS
                ));
            }
            let id = state.allocate_call_id();
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.pending_calls.insert(id, tx);

            let sent = match state.process.as_mut() {
                Some(proc) => send_raw(&mut proc.stdin, id, method, params).await,
                None => Err(anyhow::anyhow!("Agent process not running")),
            };
            if let Err(e) = sent {
                state.pending_calls.remove(&id);
                return Err(e);
            }
            (id, rx)
        };

        let limit = Duration::from_secs(self.descriptor.call_timeout_secs);
        match timeout(limit, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(anyhow::anyhow!("Agent process dropped call {}", id)),
            Err(_) => {
                let mut state = self.state.write().await;
                state.pending_calls.remove(&id);
                Err(anyhow::anyhow!(
                    "Agent '{}' call '{}' timed out after {}s",
                    self.descriptor.name,
                    method,
                    self.descriptor.call_timeout_secs
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_format() {
        let request = serde_json::json!({
            "id": 42u64,
            "method": "execute",
            "params": {"request": {"prompt": "hi"}}
        });
        let line = format!("{}\n", request);
        assert!(line.starts_with("{\"id\":42,"));
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["method"], "execute");
        assert_eq!(parsed["params"]["request"]["prompt"], "hi");
    }
}
