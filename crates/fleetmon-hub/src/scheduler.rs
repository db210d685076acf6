use crate::state::AppState;
use fleetmon_core::CommandPayload;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed-cadence collection trigger: every `collect_interval`, enqueue a
/// `report_now` job for each currently connected agent. Disconnected agents
/// are skipped here; durability for them comes from operator-triggered jobs,
/// not the cadence sweep.
pub fn spawn(app: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if app.config.collect_interval.is_zero() {
            debug!(event = "collection_disabled");
            return;
        }
        let mut ticker = tokio::time::interval(app.config.collect_interval);
        // The first tick of an interval fires immediately; skip it so a
        // restart does not trigger a fleet-wide sweep.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ids = app.registry.connected_ids();
            if ids.is_empty() {
                debug!(event = "collection_skipped", reason = "no connected agents");
                continue;
            }
            let mut enqueued = 0;
            for agent_id in ids {
                let payload = CommandPayload::report_now(&agent_id);
                match app.enqueue_command("report_now", &payload) {
                    Ok(_) => enqueued += 1,
                    Err(err) => {
                        warn!(event = "collection_enqueue_error", agent_id = %agent_id, error = %err);
                    }
                }
            }
            info!(event = "collection_scheduled", enqueued = enqueued);
        }
    })
}
