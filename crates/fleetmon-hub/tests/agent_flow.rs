use chrono::Utc;
use fleetmon_core::{CommandPayload, JobStatus};
use fleetmon_hub::{build_router, worker, AppState, Config, AGENT_COMMANDS_QUEUE};
use fleetmon_storage::QueueStore;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const API_TOKEN: &str = "test-token";
const AGENT_ID: &str = "host-42";
const AGENT_KEY: &str = "s3cret";

struct TestHub {
    addr: SocketAddr,
    app: Arc<AppState>,
    _dir: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
    worker: tokio::task::JoinHandle<()>,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.server.abort();
        self.worker.abort();
    }
}

async fn spawn_hub(job_attempts: u32, job_backoff_ms: u64) -> TestHub {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path: PathBuf = dir.path().join("fleetmon.db");
    let store = QueueStore::open(&db_path).expect("open store");
    store
        .upsert_agent_credentials(AGENT_ID, AGENT_KEY, Some("test agent"), Utc::now())
        .expect("seed credentials");

    let config = Config {
        addr: "127.0.0.1:0".to_string(),
        db_path,
        api_token: API_TOKEN.to_string(),
        poll_interval: Duration::from_millis(50),
        worker_concurrency: 4,
        collect_interval: Duration::ZERO,
        write_timeout: Duration::from_secs(1),
        job_attempts,
        job_backoff_ms,
        job_backoff_multiplier: 1,
        debug: false,
        log_dir: String::new(),
    };

    let app = Arc::new(AppState::new(config, store));
    let worker = worker::spawn(app.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = build_router(app.clone());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestHub {
        addr,
        app,
        _dir: dir,
        server,
        worker,
    }
}

type AgentSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn connect_agent(
    addr: SocketAddr,
    api_id: Option<&str>,
    api_key: Option<&str>,
) -> Result<AgentSocket, WsError> {
    let mut request = format!("ws://{addr}/api/v1/agents/ws")
        .into_client_request()
        .expect("client request");
    if let Some(api_id) = api_id {
        request
            .headers_mut()
            .insert("x-api-id", HeaderValue::from_str(api_id).expect("header"));
    }
    if let Some(api_key) = api_key {
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_str(api_key).expect("header"));
    }
    // Pretend a TLS-terminating proxy sits in front of the hub.
    request
        .headers_mut()
        .insert("x-forwarded-proto", HeaderValue::from_static("https"));
    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

async fn expect_text_frame(socket: &mut AgentSocket) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("frame before timeout")
        .expect("socket still open")
        .expect("frame read");
    match frame {
        Message::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let auth = token
        .map(|token| format!("Authorization: Bearer {token}\r\n"))
        .unwrap_or_default();
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n{auth}\r\n{body}",
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("response before timeout")
        .expect("read response");
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn rejected_upgrades_share_a_uniform_response() {
    let hub = spawn_hub(3, 100).await;

    for (api_id, api_key) in [
        (Some(AGENT_ID), Some("wrong-key")),
        (Some("host-unknown"), Some(AGENT_KEY)),
        (Some(AGENT_ID), None),
        (None, None),
    ] {
        match connect_agent(hub.addr, api_id, api_key).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), 404, "case {api_id:?}/{api_key:?}");
            }
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }
    assert!(!hub.app.registry.is_open(AGENT_ID));
}

#[tokio::test]
async fn connected_agent_gets_ack_and_shows_up_in_status() {
    let hub = spawn_hub(3, 100).await;

    let mut socket = connect_agent(hub.addr, Some(AGENT_ID), Some(AGENT_KEY))
        .await
        .expect("authorized connect");
    let ack = expect_text_frame(&mut socket).await;
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&ack).expect("ack json"),
        serde_json::json!({"type": "connected"})
    );

    let app = hub.app.clone();
    wait_until(|| app.registry.is_open(AGENT_ID), "registry to see agent").await;

    let (status, body) = http_request(
        hub.addr,
        "GET",
        &format!("/api/v1/ws/status/{AGENT_ID}"),
        Some(API_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("\"connected\":true"), "body: {body}");
    assert!(body.contains("\"secure\":true"), "body: {body}");

    socket.close(None).await.expect("close");
    let app = hub.app.clone();
    wait_until(|| !app.registry.is_open(AGENT_ID), "registry to drop agent").await;

    let (status, body) = http_request(
        hub.addr,
        "GET",
        &format!("/api/v1/ws/status/{AGENT_ID}"),
        Some(API_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("\"connected\":false"), "body: {body}");
}

#[tokio::test]
async fn stale_close_does_not_evict_superseding_connection() {
    let hub = spawn_hub(3, 100).await;

    let mut first = connect_agent(hub.addr, Some(AGENT_ID), Some(AGENT_KEY))
        .await
        .expect("first connect");
    expect_text_frame(&mut first).await;
    let app = hub.app.clone();
    wait_until(|| app.registry.is_open(AGENT_ID), "first registration").await;

    let mut second = connect_agent(hub.addr, Some(AGENT_ID), Some(AGENT_KEY))
        .await
        .expect("second connect");
    expect_text_frame(&mut second).await;

    // The first connection's close lands after the second registered.
    first.close(None).await.expect("close first");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(hub.app.registry.is_open(AGENT_ID));

    second.close(None).await.expect("close second");
    let app = hub.app.clone();
    wait_until(|| !app.registry.is_open(AGENT_ID), "second close").await;
}

#[tokio::test]
async fn settings_update_job_flows_to_connected_agent() {
    let hub = spawn_hub(3, 100).await;

    let mut socket = connect_agent(hub.addr, Some(AGENT_ID), Some(AGENT_KEY))
        .await
        .expect("connect");
    expect_text_frame(&mut socket).await;
    let app = hub.app.clone();
    wait_until(|| app.registry.is_open(AGENT_ID), "registration").await;

    let (status, body) = http_request(
        hub.addr,
        "POST",
        &format!("/api/v1/agents/{AGENT_ID}/settings"),
        Some(API_TOKEN),
        Some(r#"{"update_interval": 30}"#),
    )
    .await;
    assert_eq!(status, 200);
    let response: serde_json::Value = serde_json::from_str(body.trim()).expect("json body");
    let job_id = response["data"]["jobId"]
        .as_str()
        .expect("job id in response")
        .to_string();

    // The worker should dispatch exactly one settings_update frame.
    let frame = expect_text_frame(&mut socket).await;
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&frame).expect("frame json"),
        serde_json::json!({"type": "settings_update", "update_interval": 30})
    );

    let app = hub.app.clone();
    let job_id_for_wait = job_id.clone();
    wait_until(
        move || {
            app.store
                .lock()
                .unwrap()
                .job_history(&job_id_for_wait)
                .ok()
                .flatten()
                .is_some_and(|record| record.status == JobStatus::Completed)
        },
        "job completion",
    )
    .await;

    let record = hub
        .app
        .store
        .lock()
        .unwrap()
        .job_history(&job_id)
        .expect("query")
        .expect("record");
    assert_eq!(record.attempt_number, 1);
    assert_eq!(
        record.output,
        Some(serde_json::json!({"delivered": true, "update_interval": 30}))
    );

    // The inspection API reflects the same run.
    let (status, body) = http_request(
        hub.addr,
        "GET",
        &format!("/api/v1/agents/{AGENT_ID}/jobs"),
        Some(API_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains(&job_id), "body: {body}");
    assert!(body.contains("\"completed\""), "body: {body}");

    let (status, body) = http_request(
        hub.addr,
        "GET",
        "/api/v1/automation/stats",
        Some(API_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains(AGENT_COMMANDS_QUEUE), "body: {body}");
    assert!(body.contains("\"completed\":1"), "body: {body}");
}

#[tokio::test]
async fn job_against_disconnected_agent_exhausts_its_retries() {
    let hub = spawn_hub(2, 50).await;

    let job_id = hub
        .app
        .enqueue_command("report_now", &CommandPayload::report_now(AGENT_ID))
        .expect("enqueue");

    let app = hub.app.clone();
    wait_until(
        move || {
            app.store
                .lock()
                .unwrap()
                .queue_counts(AGENT_COMMANDS_QUEUE)
                .map(|counts| counts.failed == 1)
                .unwrap_or(false)
        },
        "terminal failure",
    )
    .await;

    let store = hub.app.store.lock().unwrap();
    let record = store.job_history(&job_id).expect("query").expect("record");
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempt_number, 2);
    assert_eq!(record.error_message.as_deref(), Some("agent not connected"));
    assert_eq!(store.history_rows_for_job(&job_id).expect("rows"), 1);
}

#[tokio::test]
async fn status_stream_reports_connect_and_disconnect() {
    let hub = spawn_hub(3, 100).await;

    let mut socket = connect_agent(hub.addr, Some(AGENT_ID), Some(AGENT_KEY))
        .await
        .expect("connect");
    expect_text_frame(&mut socket).await;
    let app = hub.app.clone();
    wait_until(|| app.registry.is_open(AGENT_ID), "registration").await;

    let mut stream = TcpStream::connect(hub.addr).await.expect("tcp connect");
    let request = format!(
        "GET /api/v1/ws/status/{AGENT_ID}/stream?token={API_TOKEN} HTTP/1.1\r\n\
         Host: localhost\r\nAccept: text/event-stream\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut received = String::new();
    read_stream_until(&mut stream, &mut received, "\"connected\":true").await;

    socket.close(None).await.expect("close agent");
    read_stream_until(&mut stream, &mut received, "\"connected\":false").await;

    // Both frames arrived in order on the same stream.
    let connected_at = received.find("\"connected\":true").expect("connect frame");
    let disconnected_at = received
        .find("\"connected\":false")
        .expect("disconnect frame");
    assert!(connected_at < disconnected_at);

    // Closing the stream releases its bus subscription.
    drop(stream);
    let app = hub.app.clone();
    wait_until(
        move || app.bus.subscriber_count(AGENT_ID) == 0,
        "subscription release",
    )
    .await;
}

async fn read_stream_until(stream: &mut TcpStream, received: &mut String, needle: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 1024];
    while !received.contains(needle) {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {needle:?}; got: {received}");
        }
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("read before timeout")
            .expect("stream read");
        if read == 0 {
            panic!("stream ended before {needle:?}; got: {received}");
        }
        received.push_str(&String::from_utf8_lossy(&chunk[..read]));
    }
}

#[tokio::test]
async fn rest_routes_require_the_bearer_token() {
    let hub = spawn_hub(3, 100).await;

    let (status, _body) = http_request(
        hub.addr,
        "GET",
        &format!("/api/v1/ws/status/{AGENT_ID}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, 401);

    let (status, _body) = http_request(
        hub.addr,
        "GET",
        &format!("/api/v1/ws/status/{AGENT_ID}"),
        Some("not-the-token"),
        None,
    )
    .await;
    assert_eq!(status, 401);

    let (status, _body) = http_request(hub.addr, "GET", "/health", None, None).await;
    assert_eq!(status, 200);
}
