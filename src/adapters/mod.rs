//! Framework adapters: the launch/stop/probe boundary for model backends.
//!
//! One capability contract covers heterogeneous backends; the lifecycle
//! manager dispatches on [`Framework`] through the registry. Two variants
//! ship: a native-process adapter and a container adapter. Tests install
//! fakes by registering their own implementation.

mod argv;
mod container;
mod native;

pub use argv::{split_arguments, ParsedArguments};
pub use container::ContainerAdapter;
pub use native::NativeProcessAdapter;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::OrchestratorError;
use crate::models::{Framework, ModelConfig, ValidationReport};
use crate::resources::GpuInfo;

/// Errors surfaced by adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Driver, runtime, or image acquisition failed before launch.
    #[error("Resource initialization failed: {0}")]
    ResourceInit(String),

    /// The spawn or container create itself failed.
    #[error("Launch failed: {0}")]
    Launch(String),

    /// Instance is alive but never answered its health endpoint.
    #[error("Instance not ready after {0}s")]
    ReadinessTimeout(u64),

    #[error("Stop failed: {0}")]
    Stop(String),
}

impl From<AdapterError> for OrchestratorError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::InvalidConfig(m) => Self::InvalidConfig(m),
            AdapterError::ResourceInit(m) => Self::DependencyUnavailable(m),
            AdapterError::Launch(m) => Self::LaunchFailure(m),
            AdapterError::ReadinessTimeout(secs) => Self::ReadinessTimeout(secs),
            AdapterError::Stop(m) => Self::StopFailure(m),
        }
    }
}

/// Opaque handle to a launched instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceHandle {
    Process { pid: u32 },
    Container { container_id: String },
}

/// Result of a successful start.
#[derive(Debug, Clone)]
pub struct StartedInstance {
    /// Base URL the instance serves on.
    pub endpoint: String,
    pub handle: InstanceHandle,
}

/// Launch and stop budgets shared by all adapters.
#[derive(Debug, Clone)]
pub struct AdapterTimeouts {
    /// Total budget for start + readiness probing.
    pub startup: Duration,
    /// Graceful stop budget before hard termination.
    pub stop: Duration,
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(120),
            stop: Duration::from_secs(30),
        }
    }
}

/// Capability contract implemented by every backend family.
#[async_trait]
pub trait FrameworkAdapter: Send + Sync {
    /// Backend family this adapter launches.
    fn framework(&self) -> Framework;

    /// Check a configuration against this backend. No side effects.
    async fn validate(&self, config: &ModelConfig, gpus: &[GpuInfo]) -> ValidationReport;

    /// Launch an instance and wait for readiness.
    async fn start(&self, config: &ModelConfig) -> Result<StartedInstance, AdapterError>;

    /// Stop an instance. Stopping an unknown id is success.
    async fn stop(&self, model_id: &str) -> Result<(), AdapterError>;

    /// Cheap liveness check (process exists / container running), no network.
    async fn probe_process(&self, model_id: &str) -> bool;

    /// Base URL derived from the configuration.
    fn endpoint(&self, config: &ModelConfig) -> String;

    /// Framework parameter defaults.
    fn default_parameters(&self) -> BTreeMap<String, Value>;
}

/// Registration map from framework to adapter, built at init.
///
/// Tests install fakes by registering another implementation under the
/// same framework tag.
pub struct AdapterRegistry {
    adapters: HashMap<Framework, Arc<dyn FrameworkAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with both shipped adapters installed.
    pub fn with_defaults(timeouts: AdapterTimeouts) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(NativeProcessAdapter::new(timeouts.clone())));
        registry.register(Arc::new(ContainerAdapter::new(timeouts)));
        registry
    }

    /// Install an adapter, replacing any previous one for its framework.
    pub fn register(&mut self, adapter: Arc<dyn FrameworkAdapter>) {
        self.adapters.insert(adapter.framework(), adapter);
    }

    /// Look up the adapter for a framework.
    pub fn get(&self, framework: Framework) -> crate::error::Result<Arc<dyn FrameworkAdapter>> {
        self.adapters.get(&framework).cloned().ok_or_else(|| {
            OrchestratorError::InvalidConfig(format!("unsupported framework: {framework}"))
        })
    }

    pub fn supported(&self) -> Vec<Framework> {
        self.adapters.keys().copied().collect()
    }
}

/// Parameters that only feed resource estimation; never forwarded to argv.
pub(crate) const ESTIMATION_KEYS: &[&str] = &[
    "model_size_gb",
    "precision",
    "quantization",
    "context_length",
    "batch_size",
];

/// Validation shared by both adapters: device existence against the
/// snapshot and additional-parameter syntax.
pub(crate) fn validate_common(
    config: &ModelConfig,
    gpus: &[GpuInfo],
    report: &mut ValidationReport,
) {
    for device_id in &config.gpu_devices {
        if !gpus.iter().any(|g| g.device_id == *device_id) {
            report.error(format!(
                "gpu device {device_id} not present in current snapshot"
            ));
        }
    }

    let parsed = split_arguments(config.additional_parameters.as_deref());
    if let Some(warning) = parsed.warning {
        report.warn(warning);
    }
}

/// Poll `base_url + path` until a 2xx response or the budget elapses.
pub(crate) async fn wait_ready(
    http: &reqwest::Client,
    base_url: &str,
    path: &str,
    budget: Duration,
) -> Result<(), AdapterError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let deadline = tokio::time::Instant::now() + budget;
    let poll = Duration::from_millis(500);

    loop {
        match http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => {}
        }
        if tokio::time::Instant::now() + poll > deadline {
            return Err(AdapterError::ReadinessTimeout(budget.as_secs()));
        }
        tokio::time::sleep(poll).await;
    }
}

/// Comma-joined device list for `CUDA_VISIBLE_DEVICES`-style variables.
pub(crate) fn device_list(config: &ModelConfig) -> String {
    config
        .gpu_devices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
