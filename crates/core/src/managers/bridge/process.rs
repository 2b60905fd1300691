use std::process::Stdio;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::state::{BridgeState, ProcessHandle};
use super::BridgeAgent;

impl BridgeAgent {
    pub(crate) const MAX_RESTART_ATTEMPTS: u32 = 3;
    pub(crate) const RESTART_COOLDOWN_SECS: u64 = 5;

    /// Spawns the subprocess if it is not running. Restarts after a crash are
    /// capped and rate-limited.
    pub(crate) async fn ensure_process(&self) -> anyhow::Result<()> {
        // Single write lock so two callers cannot both spawn.
        let mut state = self.state.write().await;
        if state.closed {
            return Err(anyhow::anyhow!("Agent '{}' has been unloaded", self.descriptor.name));
        }
        if state.process.is_some() {
            return Ok(());
        }

        if let Some(last) = state.last_restart {
            if state.restart_count >= Self::MAX_RESTART_ATTEMPTS {
                return Err(anyhow::anyhow!(
                    "Max restart attempts ({}) reached for agent '{}'",
                    Self::MAX_RESTART_ATTEMPTS,
                    self.descriptor.name
                ));
            }
            let elapsed = last.elapsed().as_secs();
            if elapsed < Self::RESTART_COOLDOWN_SECS {
                return Err(anyhow::anyhow!(
                    "Restart cooldown active ({}s remaining)",
                    Self::RESTART_COOLDOWN_SECS - elapsed
                ));
            }
            state.restart_count += 1;
            info!(
                agent = %self.descriptor.name,
                "🔄 Restarting agent process (attempt {}/{})",
                state.restart_count,
                Self::MAX_RESTART_ATTEMPTS
            );
        }
        state.last_restart = Some(std::time::Instant::now());

        let d = &self.descriptor;
        info!(agent = %d.name, command = %d.command, "🚀 Spawning agent subprocess");

        let mut child = Command::new(&d.command)
            .args(&d.args)
            .envs(&d.env)
            .current_dir(d.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}' for agent '{}': {}", d.command, d.name, e))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("Failed to open stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("Failed to open stdout"))?;

        let reader_handle = tokio::spawn(read_responses(
            stdout,
            Arc::downgrade(&self.state),
            d.name.clone(),
        ));

        state.process = Some(ProcessHandle { child, stdin, reader_handle });
        Ok(())
    }

    /// Stops the subprocess and refuses further calls.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.closed = true;
        if let Some(mut proc) = state.process.take() {
            if let Err(e) = proc.child.start_kill() {
                debug!(agent = %self.descriptor.name, error = %e, "Agent process already exited");
            }
            proc.reader_handle.abort();
            info!(agent = %self.descriptor.name, "🛑 Agent subprocess stopped");
        }
        state.fail_pending("agent unloaded");
    }
}

/// Routes `{"id", "result"|"error"}` lines to the waiting callers. Exits on
/// EOF or once the owning agent is gone.
async fn read_responses(stdout: ChildStdout, state: Weak<RwLock<BridgeState>>, agent: String) {
    let mut reader = BufReader::new(stdout).lines();

    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                let Ok(val) = serde_json::from_str::<serde_json::Value>(&line) else {
                    debug!(agent = %agent, "Ignoring non-JSON line from agent process");
                    continue;
                };
                let Some(id) = val.get("id").and_then(serde_json::Value::as_u64) else {
                    continue;
                };
                let Some(shared) = state.upgrade() else {
                    return;
                };
                let mut lock = shared.write().await;
                if let Some(tx) = lock.pending_calls.remove(&id) {
                    let reply = match val.get("error") {
                        Some(err) => Err(anyhow::anyhow!("{}", error_text(err))),
                        None => {
                            if lock.note_successful_reply() {
                                info!(agent = %agent, "✅ Restarted agent process is answering, restart count cleared");
                            }
                            Ok(val.get("result").cloned().unwrap_or(serde_json::Value::Null))
                        }
                    };
                    let _ = tx.send(reply);
                }
            }
            Ok(None) => {
                warn!(agent = %agent, "🔥 Agent process closed stdout");
                break;
            }
            Err(e) => {
                error!(agent = %agent, error = %e, "🔥 Agent process reader error");
                break;
            }
        }
    }

    if let Some(shared) = state.upgrade() {
        let mut lock = shared.write().await;
        // Marked dead; the next call goes through ensure_process again.
        lock.process = None;
        lock.fail_pending("agent process crashed");
        if !lock.closed {
            info!(agent = %agent, "🔄 Agent process will restart on next call");
        }
    }
}

fn error_text(err: &serde_json::Value) -> String {
    match err {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map_or_else(|| err.to_string(), str::to_string),
        other => other.to_string(),
    }
}
