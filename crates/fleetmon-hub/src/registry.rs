use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use tokio::sync::mpsc;

/// Live connection handle for one agent socket. The writer task on the other
/// end of `sender` owns the actual transport; `conn_id` is the identity used
/// to tell a stale close apart from the current connection.
pub struct AgentHandle {
    pub conn_id: u64,
    pub sender: mpsc::Sender<Message>,
    pub secure: bool,
    pub connected_at: DateTime<Utc>,
}

impl AgentHandle {
    /// Live transport state: false once the writer task has gone away.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub secure: bool,
}

impl ConnectionInfo {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            secure: false,
        }
    }
}

/// In-memory map of agent id to its current connection. A new connection for
/// an id supersedes the old entry; an unregister only takes effect if it
/// names the connection currently stored.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<AgentHandle>>>,
    conn_counter: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store the handle for an agent, returning any handle it superseded.
    pub fn register(&self, agent_id: &str, handle: Arc<AgentHandle>) -> Option<Arc<AgentHandle>> {
        let mut connections = self.connections.write().unwrap();
        connections.insert(agent_id.to_string(), handle)
    }

    /// Remove the agent's entry, but only if `conn_id` still names the
    /// stored connection. A close event from a superseded socket arriving
    /// late must not evict its replacement.
    pub fn unregister(&self, agent_id: &str, conn_id: u64) -> bool {
        let mut connections = self.connections.write().unwrap();
        match connections.get(agent_id) {
            Some(current) if current.conn_id == conn_id => {
                connections.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    pub fn handle(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        let connections = self.connections.read().unwrap();
        connections.get(agent_id).cloned()
    }

    pub fn is_open(&self, agent_id: &str) -> bool {
        let connections = self.connections.read().unwrap();
        connections
            .get(agent_id)
            .is_some_and(|handle| handle.is_open())
    }

    pub fn info(&self, agent_id: &str) -> ConnectionInfo {
        let connections = self.connections.read().unwrap();
        match connections.get(agent_id) {
            Some(handle) => ConnectionInfo {
                connected: handle.is_open(),
                secure: handle.secure,
            },
            None => ConnectionInfo::disconnected(),
        }
    }

    /// Ids whose transport is currently open.
    pub fn connected_ids(&self) -> Vec<String> {
        let connections = self.connections.read().unwrap();
        let mut ids: Vec<String> = connections
            .iter()
            .filter(|(_, handle)| handle.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every registered handle, open or not. Broadcast wants the full set so
    /// it can report closed-but-not-yet-unregistered transports as failures.
    pub fn all_handles(&self) -> Vec<(String, Arc<AgentHandle>)> {
        let connections = self.connections.read().unwrap();
        connections
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        let connections = self.connections.read().unwrap();
        connections
            .values()
            .filter(|handle| handle.is_open())
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
