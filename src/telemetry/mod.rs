//! Telemetry for the orchestrator.
//!
//! Structured logging via `tracing` and a value-oriented metrics store that
//! backs the monitoring endpoints, complementing the `metrics` facade.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_health_check, record_lifecycle_transition, record_proxy_request, record_restart,
    MetricsSnapshot, MetricsStore,
};
