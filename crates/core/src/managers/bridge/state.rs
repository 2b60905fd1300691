use std::collections::HashMap;
use tokio::process::Child;
use tokio::sync::oneshot;

pub(crate) type PendingReply = oneshot::Sender<anyhow::Result<serde_json::Value>>;

pub(crate) struct BridgeState {
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) pending_calls: HashMap<u64, PendingReply>,
    pub(crate) next_call_id: u64,
    pub(crate) restart_count: u32,
    pub(crate) last_restart: Option<std::time::Instant>,
    /// Set once the agent has been unloaded; no further spawns are allowed.
    pub(crate) closed: bool,
}

pub(crate) struct ProcessHandle {
    /// Spawned with `kill_on_drop`; dropping the handle stops the subprocess.
    pub(crate) child: Child,
    pub(crate) stdin: tokio::process::ChildStdin,
    pub(crate) reader_handle: tokio::task::JoinHandle<()>,
}

impl BridgeState {
    pub(crate) fn new() -> Self {
        Self {
            process: None,
            pending_calls: HashMap::new(),
            next_call_id: 1u64,
            restart_count: 0,
            last_restart: None,
            closed: false,
        }
    }

    /// Call ids start at 1 and skip 0 on wraparound.
    pub(crate) fn allocate_call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id = if self.next_call_id == u64::MAX {
            1
        } else {
            self.next_call_id + 1
        };
        id
    }

    /// A successful reply proves the current process is healthy; earlier
    /// crashes no longer count against the restart cap. Returns true if the
    /// count was cleared.
    pub(crate) fn note_successful_reply(&mut self) -> bool {
        if self.restart_count == 0 {
            return false;
        }
        self.restart_count = 0;
        true
    }

    pub(crate) fn fail_pending(&mut self, reason: &str) {
        for (_, tx) in self.pending_calls.drain() {
            let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
        }
    }
}
