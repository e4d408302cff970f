//! Runtime status and health types shared across components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use super::config::Framework;

/// Orchestrator view of a model's lifecycle stage.
///
/// Distinct from [`HealthStatus`]: a model can be RUNNING and unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Most recent health judgment for a running model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No probe has completed yet.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Result of one health probe against a model instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub model_id: String,
    pub status: HealthStatus,
    pub check_time: DateTime<Utc>,
    /// Probe round-trip in seconds; `None` when the probe never completed.
    pub response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Response body fields, when the instance returned JSON.
    #[serde(default)]
    pub details: Map<String, serde_json::Value>,
}

impl HealthCheckResult {
    pub fn healthy(model_id: &str, response_time: f64) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: HealthStatus::Healthy,
            check_time: Utc::now(),
            response_time: Some(response_time),
            error_message: None,
            details: Map::new(),
        }
    }

    pub fn unhealthy(model_id: &str, error: String, response_time: Option<f64>) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: HealthStatus::Unhealthy,
            check_time: Utc::now(),
            response_time,
            error_message: Some(error),
            details: Map::new(),
        }
    }
}

/// Public summary of one registered model, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub framework: Framework,
    pub status: ModelStatus,
    pub health: HealthStatus,
    pub priority: u8,
    pub gpu_devices: Vec<u32>,
    /// Base URL of the running instance; `None` unless RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
