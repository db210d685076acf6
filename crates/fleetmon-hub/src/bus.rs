use crate::registry::ConnectionInfo;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ConnectionInfo>,
}

/// Per-agent connection-change fan-out. Each status stream holds a
/// [`Subscription`]; delivery is synchronous and best-effort, and a dead
/// subscriber never blocks the remaining ones.
pub struct StatusBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl StatusBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(self: &Arc<Self>, agent_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers
            .entry(agent_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Subscription {
            bus: self.clone(),
            agent_id: agent_id.to_string(),
            id,
            rx,
        }
    }

    pub fn notify(&self, agent_id: &str, info: ConnectionInfo) {
        let subscribers = self.subscribers.lock().unwrap();
        let Some(entries) = subscribers.get(agent_id) else {
            return;
        };
        for subscriber in entries {
            if subscriber.tx.send(info).is_err() {
                // Receiver already gone; its guard will clean the entry up.
                warn!(
                    event = "subscriber_send_failed",
                    agent_id = agent_id,
                    subscriber_id = subscriber.id
                );
            }
        }
    }

    fn remove(&self, agent_id: &str, subscriber_id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(entries) = subscribers.get_mut(agent_id) {
            entries.retain(|subscriber| subscriber.id != subscriber_id);
            if entries.is_empty() {
                subscribers.remove(agent_id);
            }
        }
    }

    pub fn subscriber_count(&self, agent_id: &str) -> usize {
        let subscribers = self.subscribers.lock().unwrap();
        subscribers
            .get(agent_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of one subscription. Dropping it releases the bus entry;
/// the guard makes the release happen exactly once no matter how the owning
/// stream ends.
pub struct Subscription {
    bus: Arc<StatusBus>,
    agent_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<ConnectionInfo>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ConnectionInfo> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConnectionInfo> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(
            event = "subscription_released",
            agent_id = %self.agent_id,
            subscriber_id = self.id
        );
        self.bus.remove(&self.agent_id, self.id);
    }
}
