use crate::bus::StatusBus;
use crate::config::Config;
use crate::dispatch::CommandDispatcher;
use crate::registry::ConnectionRegistry;
use crate::{gateway, routes};
use anyhow::{anyhow, Context};
use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use fleetmon_core::{CommandPayload, RetryPolicy};
use fleetmon_storage::{NewJob, QueueStore};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Queue that carries commands addressed to individual agents.
pub const AGENT_COMMANDS_QUEUE: &str = "agent-commands";

/// Everything the handlers need, built once in `main` and injected through
/// axum's `State`.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<StatusBus>,
    pub dispatcher: CommandDispatcher,
    pub store: Arc<Mutex<QueueStore>>,
}

impl AppState {
    pub fn new(config: Config, store: QueueStore) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            config,
            dispatcher: CommandDispatcher::new(registry.clone()),
            registry,
            bus: Arc::new(StatusBus::new()),
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Retry policy applied to command jobs enqueued by triggers and the
    /// scheduler.
    pub fn command_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.job_attempts,
            self.config.job_backoff_ms,
            self.config.job_backoff_multiplier,
        )
    }

    /// Persist a command job on the agent-commands queue, returning its id.
    pub fn enqueue_command(
        &self,
        job_name: &str,
        payload: &CommandPayload,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload_value =
            serde_json::to_value(payload).context("serialize command payload")?;
        let store = self
            .store
            .lock()
            .map_err(|_| anyhow!("job store lock poisoned"))?;
        store.enqueue(
            &NewJob {
                id: &id,
                queue_name: AGENT_COMMANDS_QUEUE,
                job_name,
                agent_id: &payload.agent_id,
                payload: &payload_value,
                policy: self.command_policy(),
            },
            Utc::now(),
        )?;
        Ok(id)
    }
}

pub fn build_router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/agents/ws", get(gateway::agent_ws))
        .route("/api/v1/ws/status/:agent_id", get(routes::connection_status))
        .route(
            "/api/v1/ws/status/:agent_id/stream",
            get(routes::connection_status_stream),
        )
        .route("/api/v1/ws/connections", get(routes::connected_agents))
        .route(
            "/api/v1/agents/:agent_id/report-now",
            post(routes::trigger_report_now),
        )
        .route(
            "/api/v1/agents/:agent_id/settings",
            post(routes::trigger_settings_update),
        )
        .route(
            "/api/v1/agents/broadcast/update-notification",
            post(routes::broadcast_update_notification),
        )
        .route("/api/v1/agents/:agent_id/jobs", get(routes::agent_job_history))
        .route("/api/v1/automation/stats", get(routes::queue_stats))
        .route(
            "/api/v1/automation/stats/:queue_name",
            get(routes::queue_stats_for),
        )
        .route(
            "/api/v1/automation/jobs/:queue_name",
            get(routes::recent_jobs),
        )
        .route("/api/v1/automation/health", get(routes::queue_health))
        .route("/health", get(|| async { "ok" }))
        .with_state(app)
}
