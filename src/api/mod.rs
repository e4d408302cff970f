//! Control-API surface: handler functions plus the axum transport.

pub mod handlers;
mod server;

pub use handlers::{
    GpuMonitoringReport, ModelStatusResponse, OperationResult, SystemMetricsReport,
    SystemOverview, UpdateResponse,
};
pub use server::router;
