pub mod bus;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod logging;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use config::Config;
pub use state::{build_router, AppState, AGENT_COMMANDS_QUEUE};
