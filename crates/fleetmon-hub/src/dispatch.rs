use crate::registry::ConnectionRegistry;
use axum::extract::ws::Message;
use fleetmon_core::AgentCommand;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Partial-failure counts from a fleet-wide push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Best-effort sender of control frames to live agent connections. Writes
/// are fire-and-forget: a failed write is logged and reported through the
/// return value, never raised.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Push one command to one agent. Returns false without writing when the
    /// agent has no open connection.
    pub fn push_to_one(&self, agent_id: &str, command: &AgentCommand) -> bool {
        let Some(handle) = self.registry.handle(agent_id) else {
            debug!(event = "push_skipped", agent_id = agent_id, kind = command.kind());
            return false;
        };
        if !handle.is_open() {
            debug!(event = "push_skipped", agent_id = agent_id, kind = command.kind());
            return false;
        }
        let delivered = send_frame(&handle.sender, command);
        if !delivered {
            warn!(event = "push_write_failed", agent_id = agent_id, kind = command.kind());
        }
        delivered
    }

    /// Push one command to every registered agent, counting transports that
    /// turned out to be closed as failures.
    pub fn broadcast(&self, command: &AgentCommand) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        for (agent_id, handle) in self.registry.all_handles() {
            outcome.attempted += 1;
            if handle.is_open() && send_frame(&handle.sender, command) {
                outcome.succeeded += 1;
            } else {
                outcome.failed += 1;
                warn!(event = "broadcast_miss", agent_id = %agent_id, kind = command.kind());
            }
        }
        debug!(
            event = "broadcast_done",
            kind = command.kind(),
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            failed = outcome.failed
        );
        outcome
    }
}

fn send_frame(sender: &tokio::sync::mpsc::Sender<Message>, command: &AgentCommand) -> bool {
    match serde_json::to_string(command) {
        Ok(text) => sender.try_send(Message::Text(text)).is_ok(),
        Err(err) => {
            warn!(event = "frame_encode_failed", error = %err);
            false
        }
    }
}
