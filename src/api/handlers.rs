//! Control-API handlers.
//!
//! Plain library functions over the orchestrator: the HTTP transport is a
//! thin shell around these, so a different route framework (or none) can
//! consume them directly.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::health::{HealthStats, RecoveryState};
use crate::manager::UpdateOutcome;
use crate::models::{HealthStatus, ModelConfig, ModelInfo, ModelStatus, ValidationReport};
use crate::proxy::ProxyStats;
use crate::reload::ReloadStatus;
use crate::resources::{calculator, FragmentationReport, GpuInfo, GpuProbe};
use crate::telemetry::MetricsSnapshot;
use crate::Orchestrator;

/// Liveness probe payload.
pub fn health() -> Value {
    json!({ "status": "ok" })
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemOverview {
    pub total_models: usize,
    pub running_models: usize,
    pub total_gpus: usize,
    pub available_gpus: usize,
    pub uptime_secs: u64,
    pub hostname: String,
    pub version: &'static str,
}

pub async fn system_overview(orch: &Orchestrator) -> Result<SystemOverview> {
    let gpus = orch.scheduler.effective_snapshot().await.unwrap_or_default();
    Ok(SystemOverview {
        total_models: orch.manager.count().await,
        running_models: orch.manager.list_running().await.len(),
        total_gpus: gpus.len(),
        available_gpus: gpus.iter().filter(|g| g.memory_free > 0).count(),
        uptime_secs: orch.uptime_secs(),
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Raw device snapshot.
pub async fn system_gpu(orch: &Orchestrator) -> Result<Vec<GpuInfo>> {
    orch.probe.detect().await
}

pub async fn list_models(orch: &Orchestrator) -> Vec<ModelInfo> {
    orch.manager.list().await
}

pub async fn create_model(orch: &Orchestrator, config: ModelConfig) -> Result<ModelInfo> {
    let model_id = orch.manager.create(config).await?;
    orch.manager.get_info(&model_id).await
}

pub async fn get_model(orch: &Orchestrator, model_id: &str) -> Result<ModelInfo> {
    orch.manager.get_info(model_id).await
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResponse {
    pub model: ModelInfo,
    pub requires_restart: bool,
    pub restarted: bool,
}

pub async fn update_model(
    orch: &Orchestrator,
    model_id: &str,
    config: ModelConfig,
) -> Result<UpdateResponse> {
    let UpdateOutcome {
        requires_restart,
        restarted,
    } = orch.manager.update_config(model_id, config, true).await?;
    Ok(UpdateResponse {
        model: orch.manager.get_info(model_id).await?,
        requires_restart,
        restarted,
    })
}

/// Result object for destructive operations; returned with `success:
/// false` and a message even when the operation failed.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

pub async fn delete_model(orch: &Orchestrator, model_id: &str) -> Result<OperationResult> {
    orch.manager.delete(model_id).await?;
    orch.recovery.forget(model_id);
    Ok(OperationResult::ok(format!("model {model_id} deleted")))
}

pub async fn start_model(orch: &Orchestrator, model_id: &str) -> Result<OperationResult> {
    orch.manager.start(model_id).await?;
    Ok(OperationResult::ok(format!("model {model_id} started")))
}

pub async fn stop_model(orch: &Orchestrator, model_id: &str) -> Result<OperationResult> {
    orch.manager.stop(model_id).await?;
    Ok(OperationResult::ok(format!("model {model_id} stopped")))
}

pub async fn restart_model(orch: &Orchestrator, model_id: &str) -> Result<OperationResult> {
    orch.manager.restart(model_id).await?;
    Ok(OperationResult::ok(format!("model {model_id} restarted")))
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatusResponse {
    pub status: ModelStatus,
    pub health: HealthStatus,
    pub endpoint: Option<String>,
    pub health_stats: Option<HealthStats>,
    pub recovery: Option<RecoveryState>,
}

pub async fn model_status(orch: &Orchestrator, model_id: &str) -> Result<ModelStatusResponse> {
    let info = orch.manager.get_info(model_id).await?;
    Ok(ModelStatusResponse {
        status: info.status,
        health: info.health,
        endpoint: info.endpoint,
        health_stats: orch.checker.get_statistics(model_id).await,
        recovery: orch.recovery.state(model_id),
    })
}

/// Pure validation, no persistence.
pub async fn validate_model(orch: &Orchestrator, config: ModelConfig) -> Result<ValidationReport> {
    orch.manager.validate(&config).await
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuMonitoringReport {
    pub gpus: Vec<GpuInfo>,
    pub fragmentation: FragmentationReport,
}

pub async fn monitoring_gpu(orch: &Orchestrator) -> Result<GpuMonitoringReport> {
    let gpus = orch.probe.detect().await?;
    let fragmentation = calculator::fragmentation(&gpus);
    Ok(GpuMonitoringReport {
        gpus,
        fragmentation,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsReport {
    pub metrics: MetricsSnapshot,
    pub proxy: ProxyStats,
    pub reload: ReloadStatus,
    pub health: HashMap<String, HealthStatus>,
}

pub async fn monitoring_system(orch: &Orchestrator) -> Result<SystemMetricsReport> {
    Ok(SystemMetricsReport {
        metrics: orch.metrics.snapshot(),
        proxy: orch.proxy.stats(),
        reload: orch.reload.status().await,
        health: orch.checker.get_all_status().await,
    })
}
