use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: PathBuf,
    pub api_token: String,
    pub poll_interval: Duration,
    pub worker_concurrency: usize,
    pub collect_interval: Duration,
    pub write_timeout: Duration,
    pub job_attempts: u32,
    pub job_backoff_ms: u64,
    pub job_backoff_multiplier: u32,
    pub debug: bool,
    pub log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "fleetmon-hub")]
pub struct Args {
    /// Listen address, host:port
    #[arg(long, default_value = "")]
    pub addr: String,
    /// SQLite database path
    #[arg(long, default_value = "")]
    pub db: String,
    /// Bearer token required by the status and automation routes
    #[arg(long, default_value = "")]
    pub api_token: String,
    /// Worker poll interval in seconds
    #[arg(long, default_value_t = 1)]
    pub poll_interval: u64,
    /// Max jobs processed concurrently
    #[arg(long, default_value_t = 10)]
    pub worker_concurrency: usize,
    /// Cadence of the fleet-wide collection trigger in seconds, 0 disables
    #[arg(long, default_value_t = 3600)]
    pub collect_interval: u64,
    /// Socket write timeout in seconds
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    /// Attempt cap for enqueued command jobs
    #[arg(long, default_value_t = 3)]
    pub job_attempts: u32,
    /// Base retry delay for enqueued command jobs, milliseconds
    #[arg(long, default_value_t = 2000)]
    pub job_backoff_ms: u64,
    /// Retry delay growth factor per attempt
    #[arg(long, default_value_t = 2)]
    pub job_backoff_multiplier: u32,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_string(&args.addr, "FLEETMON_ADDR", "127.0.0.1:8180"),
        db_path: PathBuf::from(resolve_string(&args.db, "FLEETMON_DB", "fleetmon.db")),
        api_token: resolve_string(&args.api_token, "FLEETMON_API_TOKEN", ""),
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        worker_concurrency: args.worker_concurrency.max(1),
        collect_interval: Duration::from_secs(args.collect_interval),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        job_attempts: args.job_attempts.max(1),
        job_backoff_ms: args.job_backoff_ms,
        job_backoff_multiplier: args.job_backoff_multiplier.max(1),
        debug: args.debug || env_true("FLEETMON_DEBUG"),
        log_dir: resolve_string(&args.log_dir, "FLEETMON_LOG_DIR", ""),
    }
}

fn resolve_string(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
