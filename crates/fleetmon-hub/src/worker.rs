use crate::state::AppState;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use fleetmon_core::{AgentCommand, CommandPayload, JobRecord, JobStatus};
use fleetmon_storage::{ClaimedJob, QueueStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// What one attempt at a job came to. Transient failures go back through
/// the backoff schedule; permanent ones are terminal on the spot.
enum AttemptOutcome {
    Completed { agent_id: String, output: Value },
    Transient { agent_id: String, message: String },
    Permanent { agent_id: String, message: String },
}

/// Poll-claim worker loop: every tick, claim as many due jobs as there are
/// free permits and process them concurrently.
pub fn spawn(app: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(app.config.worker_concurrency));
        let mut ticker = tokio::time::interval(app.config.poll_interval);
        loop {
            ticker.tick().await;
            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }
            let due = match app.store.lock() {
                Ok(mut store) => store.claim_due(Utc::now(), available as u32),
                Err(_) => {
                    error!(event = "store_lock_poisoned");
                    continue;
                }
            };
            let due = match due {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!(event = "claim_error", error = %err);
                    continue;
                }
            };
            for job in due {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    return;
                };
                let app = app.clone();
                tokio::spawn(async move {
                    process_job(&app, &job);
                    drop(permit);
                });
            }
        }
    })
}

/// Run one attempt and record its outcome: queue-state transition plus the
/// upsert into the single history row for this job id.
pub fn process_job(app: &AppState, job: &ClaimedJob) {
    let attempt = job.attempts_made + 1;
    let outcome = run_attempt(app, job);
    if let Err(err) = write_outcome(app, job, &outcome, attempt, Utc::now()) {
        error!(event = "job_record_error", job_id = %job.id, error = %err);
    }
}

fn run_attempt(app: &AppState, job: &ClaimedJob) -> AttemptOutcome {
    let payload: CommandPayload = match serde_json::from_value(job.payload.clone()) {
        Ok(payload) => payload,
        Err(err) => {
            return AttemptOutcome::Permanent {
                agent_id: raw_agent_id(&job.payload),
                message: format!("malformed payload: {err}"),
            }
        }
    };
    let agent_id = payload.agent_id.clone();

    let command = match payload.validate() {
        Ok(command) => command,
        Err(err) => {
            return AttemptOutcome::Permanent {
                agent_id,
                message: err.to_string(),
            }
        }
    };

    if !app.registry.is_open(&agent_id) {
        return AttemptOutcome::Transient {
            agent_id,
            message: "agent not connected".to_string(),
        };
    }

    if !app.dispatcher.push_to_one(&agent_id, &command) {
        // The connection dropped between the liveness check and the write.
        return AttemptOutcome::Transient {
            agent_id,
            message: "dispatch write failed".to_string(),
        };
    }

    let output = match command {
        AgentCommand::SettingsUpdate { update_interval } => {
            serde_json::json!({"delivered": true, "update_interval": update_interval})
        }
        _ => serde_json::json!({"delivered": true}),
    };
    AttemptOutcome::Completed { agent_id, output }
}

fn write_outcome(
    app: &AppState,
    job: &ClaimedJob,
    outcome: &AttemptOutcome,
    attempt: u32,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let store = app
        .store
        .lock()
        .map_err(|_| anyhow!("job store lock poisoned"))?;

    match outcome {
        AttemptOutcome::Completed { agent_id, output } => {
            store.upsert_history(&history_record(
                job,
                agent_id,
                JobStatus::Completed,
                attempt,
                None,
                Some(output.clone()),
                Some(now),
                now,
            ))?;
            store.mark_completed(&job.id, now)?;
            info!(event = "job_completed", job_id = %job.id, agent_id = %agent_id, attempt = attempt);
        }
        AttemptOutcome::Transient { agent_id, message } => {
            store.upsert_history(&history_record(
                job,
                agent_id,
                JobStatus::Failed,
                attempt,
                Some(message.clone()),
                None,
                None,
                now,
            ))?;
            if attempt >= job.policy.max_attempts {
                store.mark_failed(&job.id, attempt, now)?;
                warn!(
                    event = "job_failed",
                    job_id = %job.id,
                    agent_id = %agent_id,
                    attempt = attempt,
                    error = %message
                );
            } else {
                let run_at = QueueStore::retry_at(job, attempt, now);
                store.mark_delayed(&job.id, attempt, run_at, now)?;
                info!(
                    event = "job_retry_scheduled",
                    job_id = %job.id,
                    agent_id = %agent_id,
                    attempt = attempt,
                    run_at = %run_at.to_rfc3339()
                );
            }
        }
        AttemptOutcome::Permanent { agent_id, message } => {
            store.upsert_history(&history_record(
                job,
                agent_id,
                JobStatus::Failed,
                attempt,
                Some(message.clone()),
                None,
                None,
                now,
            ))?;
            store.mark_failed(&job.id, attempt, now)?;
            warn!(
                event = "job_failed",
                job_id = %job.id,
                agent_id = %agent_id,
                attempt = attempt,
                error = %message
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn history_record(
    job: &ClaimedJob,
    agent_id: &str,
    status: JobStatus,
    attempt: u32,
    error_message: Option<String>,
    output: Option<Value>,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> JobRecord {
    JobRecord {
        job_id: job.id.clone(),
        queue_name: job.queue_name.clone(),
        job_name: job.job_name.clone(),
        agent_id: agent_id.to_string(),
        status,
        attempt_number: attempt,
        error_message,
        output,
        created_at: job.created_at,
        updated_at: now,
        completed_at,
    }
}

fn raw_agent_id(payload: &Value) -> String {
    payload
        .get("agent_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
