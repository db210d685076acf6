use crate::registry::AgentHandle;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use fleetmon_core::AgentCommand;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const API_ID_HEADER: &str = "x-api-id";
const API_KEY_HEADER: &str = "x-api-key";

/// Upgrade gatekeeper for the agent socket route. Every rejection — missing
/// credentials, unknown id, key mismatch, store failure — produces the same
/// body-less response so the caller cannot probe which agent ids exist.
pub async fn agent_ws(
    State(app): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    let Some(api_id) = header_value(&headers, API_ID_HEADER) else {
        return reject();
    };
    let Some(api_key) = header_value(&headers, API_KEY_HEADER) else {
        return reject();
    };

    let authorized = app
        .store
        .lock()
        .ok()
        .and_then(|store| store.verify_credentials(&api_id, &api_key).ok())
        .unwrap_or(false);
    if !authorized {
        debug!(event = "upgrade_rejected", agent_id = %api_id);
        return reject();
    }

    let secure = forwarded_https(&headers);
    ws.on_upgrade(move |socket| handle_agent_socket(app, socket, api_id, secure))
}

fn reject() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// The hub itself terminates plain HTTP; an encrypted agent connection is
/// recognized by the forwarded-protocol header the TLS proxy sets.
fn forwarded_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("https"))
}

async fn handle_agent_socket(
    app: Arc<AppState>,
    socket: WebSocket,
    agent_id: String,
    secure: bool,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_timeout = app.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
    });

    let conn_id = app.registry.next_conn_id();
    let handle = Arc::new(AgentHandle {
        conn_id,
        sender: tx.clone(),
        secure,
        connected_at: Utc::now(),
    });
    if let Some(prior) = app.registry.register(&agent_id, handle) {
        info!(
            event = "connection_superseded",
            agent_id = %agent_id,
            prior_conn_id = prior.conn_id,
            conn_id = conn_id
        );
    }
    info!(
        event = "agent_connected",
        agent_id = %agent_id,
        conn_id = conn_id,
        secure = secure,
        total = app.registry.connected_count()
    );
    app.bus.notify(&agent_id, app.registry.info(&agent_id));

    if let Ok(ack) = serde_json::to_string(&AgentCommand::Connected) {
        let _ = tx.send(Message::Text(ack)).await;
    }

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                info!(event = "agent_close", agent_id = %agent_id, conn_id = conn_id);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(_) => {
                // Agents currently have nothing to say over this socket;
                // inbound frames are drained and dropped.
            }
            Err(err) => {
                warn!(event = "read_error", agent_id = %agent_id, conn_id = conn_id, error = %err);
                break;
            }
        }
    }

    if app.registry.unregister(&agent_id, conn_id) {
        info!(
            event = "agent_disconnected",
            agent_id = %agent_id,
            conn_id = conn_id,
            total = app.registry.connected_count()
        );
        app.bus.notify(&agent_id, app.registry.info(&agent_id));
    } else {
        debug!(event = "stale_close_ignored", agent_id = %agent_id, conn_id = conn_id);
    }
    drop(tx);
    let _ = write_task.await;
}
