//! Shared fixtures for integration tests.
//!
//! A controllable fake adapter stands in for real backends, and the
//! static GPU probe simulates a device pool.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use modelserver_core::adapters::{
    AdapterError, AdapterRegistry, FrameworkAdapter, InstanceHandle, StartedInstance,
};
use modelserver_core::config::ServiceConfig;
use modelserver_core::models::{
    Framework, HealthCheckConfig, ModelConfig, ResourceRequirement, RetryPolicy, ValidationReport,
};
use modelserver_core::resources::{gpu_fixture, GpuInfo, StaticGpuProbe};
use modelserver_core::store::FileConfigStore;
use modelserver_core::{Orchestrator, OrchestratorOptions};

/// Adapter double: instant starts, togglable failures, call counting.
pub struct FakeAdapter {
    framework: Framework,
    pub start_count: AtomicUsize,
    pub fail_next_start: AtomicBool,
    running: DashMap<String, String>,
}

impl FakeAdapter {
    pub fn new(framework: Framework) -> Arc<Self> {
        Arc::new(Self {
            framework,
            start_count: AtomicUsize::new(0),
            fail_next_start: AtomicBool::new(false),
            running: DashMap::new(),
        })
    }

    pub fn starts(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameworkAdapter for FakeAdapter {
    fn framework(&self) -> Framework {
        self.framework
    }

    async fn validate(&self, _config: &ModelConfig, _gpus: &[GpuInfo]) -> ValidationReport {
        ValidationReport::valid()
    }

    async fn start(&self, config: &ModelConfig) -> Result<StartedInstance, AdapterError> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::Launch("injected start failure".to_string()));
        }
        let endpoint = self.endpoint(config);
        self.running.insert(config.id.clone(), endpoint.clone());
        Ok(StartedInstance {
            endpoint,
            handle: InstanceHandle::Process { pid: 4242 },
        })
    }

    async fn stop(&self, model_id: &str) -> Result<(), AdapterError> {
        self.running.remove(model_id);
        Ok(())
    }

    async fn probe_process(&self, model_id: &str) -> bool {
        self.running.contains_key(model_id)
    }

    fn endpoint(&self, config: &ModelConfig) -> String {
        format!(
            "http://127.0.0.1:{}",
            config.port().unwrap_or(18000)
        )
    }

    fn default_parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// A config with health checks and retries disabled, suitable for tests
/// that drive health state by hand.
pub fn model_config(id: &str, priority: u8, gpu_memory: u64) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        name: format!("model {id}"),
        framework: Framework::NativeServer,
        model_path: "/models/test.gguf".to_string(),
        priority,
        gpu_devices: vec![],
        parameters: BTreeMap::new(),
        additional_parameters: None,
        resource_requirements: ResourceRequirement {
            gpu_memory,
            gpu_devices: vec![],
            cpu_cores: None,
            system_memory: None,
        },
        health_check: HealthCheckConfig {
            enabled: false,
            ..Default::default()
        },
        retry_policy: RetryPolicy {
            enabled: false,
            ..Default::default()
        },
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn service_config(dir: &tempfile::TempDir) -> ServiceConfig {
    ServiceConfig {
        database_url: dir.path().join("models.json").display().to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.path().to_path_buf(),
        log_level: "info".to_string(),
        log_format: "json".to_string(),
        metrics_enabled: true,
        reload_interval: Duration::from_secs(1),
        startup_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub adapter: Arc<FakeAdapter>,
    pub probe: Arc<StaticGpuProbe>,
    pub _dir: tempfile::TempDir,
}

/// Full orchestrator over a fake adapter and a single-GPU pool.
pub async fn harness(free_mib: u64) -> Harness {
    harness_with(free_mib, OrchestratorOptions::default()).await
}

pub async fn harness_with(free_mib: u64, options: OrchestratorOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = service_config(&dir);
    let store = Arc::new(
        FileConfigStore::open(&config.database_url)
            .await
            .unwrap(),
    );
    let probe = Arc::new(StaticGpuProbe::new(vec![gpu_fixture(0, free_mib, 0)]));

    let adapter = FakeAdapter::new(Framework::NativeServer);
    let mut adapters = AdapterRegistry::empty();
    adapters.register(adapter.clone());
    adapters.register(FakeAdapter::new(Framework::ContainerServer));

    let orchestrator = Orchestrator::new(config, store, probe.clone(), adapters, options);
    Harness {
        orchestrator,
        adapter,
        probe,
        _dir: dir,
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
