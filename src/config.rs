//! Service configuration loading from environment variables.
//!
//! All values are loaded from `MODELSERVER_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without crashing;
//! CLI flags on the binary override the environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MODELSERVER_DATABASE_URL` | `<data_dir>/models.json` | Config-store DSN (file path) |
//! | `MODELSERVER_BIND` | `127.0.0.1:9090` | Control API bind address |
//! | `MODELSERVER_DATA_DIR` | `./data` | State directory (store, backups) |
//! | `MODELSERVER_LOG_LEVEL` | `info` | Tracing filter |
//! | `MODELSERVER_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `MODELSERVER_METRICS` | `1` | Metrics export enable |
//! | `MODELSERVER_RELOAD_INTERVAL` | 30 | Hot-reload poll interval (secs) |
//! | `MODELSERVER_STARTUP_TIMEOUT` | 120 | Instance readiness budget (secs) |
//! | `MODELSERVER_STOP_TIMEOUT` | 30 | Graceful stop budget (secs) |
//! | `MODELSERVER_SHUTDOWN_TIMEOUT` | 30 | Service drain budget (secs) |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// All service configuration, resolved from environment and defaults.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Config-store DSN. A plain path selects the file-backed store.
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub reload_interval: Duration,
    /// Budget for adapter start + readiness probing.
    pub startup_timeout: Duration,
    /// Budget for graceful instance stop before hard kill.
    pub stop_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// Serializable summary of effective values, for logging at startup.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub data_dir: String,
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub reload_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`1`/`true`/`yes`), returning `default` otherwise.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn parse_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Load all service configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> ServiceConfig {
    let data_dir = PathBuf::from(parse_string("MODELSERVER_DATA_DIR", "./data"));
    let default_dsn = data_dir.join("models.json").display().to_string();
    let database_url = parse_string("MODELSERVER_DATABASE_URL", &default_dsn);

    let bind_addr = parse_string("MODELSERVER_BIND", "127.0.0.1:9090")
        .parse()
        .unwrap_or_else(|_| "127.0.0.1:9090".parse().expect("static address"));

    let reload_secs = parse_u64("MODELSERVER_RELOAD_INTERVAL", 30).max(1);
    let startup_secs = parse_u64("MODELSERVER_STARTUP_TIMEOUT", 120).max(1);
    let stop_secs = parse_u64("MODELSERVER_STOP_TIMEOUT", 30).max(1);
    let shutdown_secs = parse_u64("MODELSERVER_SHUTDOWN_TIMEOUT", 30).max(1);

    ServiceConfig {
        database_url,
        bind_addr,
        data_dir,
        log_level: parse_string("MODELSERVER_LOG_LEVEL", "info"),
        log_format: parse_string("MODELSERVER_LOG_FORMAT", "json"),
        metrics_enabled: parse_bool("MODELSERVER_METRICS", true),
        reload_interval: Duration::from_secs(reload_secs),
        startup_timeout: Duration::from_secs(startup_secs),
        stop_timeout: Duration::from_secs(stop_secs),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
    }
}

impl ServiceConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            database_url: self.database_url.clone(),
            bind_addr: self.bind_addr.to_string(),
            data_dir: self.data_dir.display().to_string(),
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            metrics_enabled: self.metrics_enabled,
            reload_interval_secs: self.reload_interval.as_secs(),
            startup_timeout_secs: self.startup_timeout.as_secs(),
            stop_timeout_secs: self.stop_timeout.as_secs(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
        }
    }
}
