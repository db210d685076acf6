use crate::registry::ConnectionInfo;
use crate::state::{AppState, AGENT_COMMANDS_QUEUE};
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::Utc;
use fleetmon_core::{AgentCommand, CommandPayload, QueueCounts};
use fleetmon_storage::{QueueStore, StorageError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_HISTORY_LIMIT: u32 = 10;

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

fn json_ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        data,
    })
    .into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"success": false, "error": message})),
    )
        .into_response()
}

fn unauthorized() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "Authentication required")
}

fn internal_error(message: &str) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// Bearer check for the read/trigger routes. Stream clients cannot always
/// set headers, so a `token` query parameter is accepted as well.
fn authorized(app: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let expected = app.config.api_token.as_str();
    if expected.is_empty() {
        return false;
    }
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if token == expected {
                return true;
            }
        }
    }
    query_token == Some(expected)
}

fn store_read<T>(
    app: &AppState,
    op: impl FnOnce(&QueueStore) -> Result<T, StorageError>,
) -> Result<T, Response> {
    let store = app
        .store
        .lock()
        .map_err(|_| internal_error("job store unavailable"))?;
    op(&store).map_err(|err| {
        error!(event = "store_error", error = %err);
        internal_error("storage query failed")
    })
}

#[derive(Deserialize)]
pub struct TokenParams {
    token: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    token: Option<String>,
    limit: Option<u32>,
}

/// Point-in-time connection state, no database involved.
pub async fn connection_status(
    State(app): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    json_ok(app.registry.info(&agent_id))
}

/// Long-lived SSE feed of one agent's connection state: current state
/// immediately, then every bus notification, with a comment heartbeat to
/// keep intermediaries from timing the stream out. The bus subscription is
/// owned by the stream and released when the client goes away.
pub async fn connection_status_stream(
    State(app): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }

    // Subscribe before the snapshot so a transition in between is not lost.
    let subscription = app.bus.subscribe(&agent_id);
    let initial = app.registry.info(&agent_id);
    info!(event = "stream_opened", agent_id = %agent_id);

    let updates = futures_util::stream::unfold(subscription, |mut subscription| async move {
        let info = subscription.recv().await?;
        Some((status_event(info), subscription))
    });
    let stream =
        futures_util::stream::once(std::future::ready(status_event(initial))).chain(updates);

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("heartbeat"),
        )
        .into_response()
}

fn status_event(info: ConnectionInfo) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&info).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().data(data))
}

pub async fn connected_agents(
    State(app): State<Arc<AppState>>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    json_ok(app.registry.connected_ids())
}

pub async fn trigger_report_now(
    State(app): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    let payload = CommandPayload::report_now(&agent_id);
    match app.enqueue_command("report_now", &payload) {
        Ok(job_id) => json_ok(serde_json::json!({"jobId": job_id})),
        Err(err) => {
            error!(event = "enqueue_error", agent_id = %agent_id, error = %err);
            internal_error("failed to enqueue job")
        }
    }
}

#[derive(Deserialize)]
pub struct SettingsBody {
    update_interval: u64,
}

pub async fn trigger_settings_update(
    State(app): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
    Json(body): Json<SettingsBody>,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    let payload = CommandPayload::settings_update(&agent_id, body.update_interval);
    match app.enqueue_command("settings_update", &payload) {
        Ok(job_id) => json_ok(serde_json::json!({"jobId": job_id})),
        Err(err) => {
            error!(event = "enqueue_error", agent_id = %agent_id, error = %err);
            internal_error("failed to enqueue job")
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateNotificationBody {
    version: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Immediate best-effort push to the whole fleet, reporting partial-failure
/// counts instead of raising on individual misses.
pub async fn broadcast_update_notification(
    State(app): State<Arc<AppState>>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
    Json(body): Json<UpdateNotificationBody>,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    let command = AgentCommand::UpdateNotification {
        version: body.version,
        force: body.force,
        message: body.message,
    };
    let outcome = app.dispatcher.broadcast(&command);
    json_ok(outcome)
}

pub async fn agent_job_history(
    State(app): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match store_read(&app, |store| store.history_for_agent(&agent_id, limit)) {
        Ok(records) => json_ok(records),
        Err(response) => response,
    }
}

pub async fn queue_stats(
    State(app): State<Arc<AppState>>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    match store_read(&app, collect_all_counts) {
        Ok(stats) => json_ok(stats),
        Err(response) => response,
    }
}

pub async fn queue_stats_for(
    State(app): State<Arc<AppState>>,
    Path(queue_name): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    match store_read(&app, |store| store.queue_counts(&queue_name)) {
        Ok(counts) => json_ok(counts),
        Err(response) => response,
    }
}

pub async fn recent_jobs(
    State(app): State<Arc<AppState>>,
    Path(queue_name): Path<String>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match store_read(&app, |store| store.history_for_queue(&queue_name, limit)) {
        Ok(records) => json_ok(records),
        Err(response) => response,
    }
}

/// Coarse queue health for dashboards: deep backlog degrades to warning,
/// a pile of failed jobs to error.
pub async fn queue_health(
    State(app): State<Arc<AppState>>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&app, &headers, params.token.as_deref()) {
        return unauthorized();
    }
    let stats = match store_read(&app, collect_all_counts) {
        Ok(stats) => stats,
        Err(response) => return response,
    };

    let pending: u64 = stats
        .values()
        .map(|counts| counts.waiting + counts.active + counts.failed)
        .sum();
    let failed: u64 = stats.values().map(|counts| counts.failed).sum();

    let (status, message) = if failed > 10 {
        ("error", Some("High number of failed jobs"))
    } else if pending > 1_000 {
        ("warning", Some("High number of queued jobs"))
    } else {
        ("healthy", None)
    };

    json_ok(serde_json::json!({
        "status": status,
        "message": message,
        "totalJobs": pending,
        "queues": stats.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn collect_all_counts(store: &QueueStore) -> Result<BTreeMap<String, QueueCounts>, StorageError> {
    let mut stats = BTreeMap::new();
    // The command queue shows up even before its first job.
    stats.insert(
        AGENT_COMMANDS_QUEUE.to_string(),
        store.queue_counts(AGENT_COMMANDS_QUEUE)?,
    );
    for name in store.queue_names()? {
        let counts = store.queue_counts(&name)?;
        stats.insert(name, counts);
    }
    Ok(stats)
}
