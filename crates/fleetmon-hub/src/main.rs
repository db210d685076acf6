use fleetmon_hub::{build_router, config, logging, scheduler, worker, AppState};
use fleetmon_storage::QueueStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = config::load();
    let _log_guard = logging::init(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match QueueStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_error", error = %err, path = %config.db_path.display());
            return;
        }
    };

    let app = Arc::new(AppState::new(config.clone(), store));
    let worker_task = worker::spawn(app.clone());
    let scheduler_task = scheduler::spawn(app.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr, db = %config.db_path.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, build_router(app))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }

    worker_task.abort();
    scheduler_task.abort();
    info!(event = "hub_stop");
}
