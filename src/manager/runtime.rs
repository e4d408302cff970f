//! In-memory runtime record for one registered model.

use chrono::{DateTime, Utc};

use crate::adapters::InstanceHandle;
use crate::models::{HealthStatus, ModelConfig, ModelInfo, ModelStatus};
use crate::resources::ResourceAllocation;

/// Per-model runtime state owned by the lifecycle manager.
///
/// Created when the config is first registered, destroyed on delete.
/// Probe history and failure counters live in the health checker; this
/// record mirrors only the latest judgment.
#[derive(Debug, Clone)]
pub struct ModelRuntime {
    pub config: ModelConfig,
    pub status: ModelStatus,
    pub handle: Option<InstanceHandle>,
    pub endpoint: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health: HealthStatus,
    pub restart_count: u32,
    pub allocation: Option<ResourceAllocation>,
}

impl ModelRuntime {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            status: ModelStatus::Stopped,
            handle: None,
            endpoint: None,
            started_at: None,
            last_health: HealthStatus::Unknown,
            restart_count: 0,
            allocation: None,
        }
    }

    /// Clear all instance state after a stop.
    pub fn clear_instance(&mut self) {
        self.handle = None;
        self.endpoint = None;
        self.started_at = None;
        self.allocation = None;
        self.last_health = HealthStatus::Unknown;
    }

    /// Public summary for the API surface.
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            framework: self.config.framework,
            status: self.status,
            health: self.last_health,
            priority: self.config.priority,
            gpu_devices: self.config.gpu_devices.clone(),
            endpoint: self.endpoint.clone(),
            created_at: self.config.created_at,
            updated_at: self.config.updated_at,
        }
    }
}
