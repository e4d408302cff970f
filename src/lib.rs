//! ModelServer Core - multi-tenant inference-server orchestrator.
//!
//! Accepts declarative model configurations and launches, supervises,
//! health-checks, load-balances and recovers the backing model server
//! processes on a pool of GPUs. The orchestrator never performs inference
//! itself; it fans API requests out to the model instances it manages.
//!
//! # Components
//!
//! - `adapters`: uniform launch/stop/probe boundary for native-process
//!   and container backends
//! - `manager`: authoritative model registry and lifecycle state machine
//! - `resources`: GPU probe contract, estimation, priority scheduling
//! - `health`: periodic probing and backoff-driven auto-recovery
//! - `proxy`: endpoint registry, load balancing, rate limiting, failover
//! - `reload`: config hot reload against the persistent store
//! - `store`: config persistence boundary (file-backed implementation)
//! - `api`: HTTP surface handlers and the thin axum transport

pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod models;
pub mod proxy;
pub mod reload;
pub mod resources;
pub mod shutdown;
pub mod store;
pub mod telemetry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use adapters::{AdapterRegistry, AdapterTimeouts};
use config::ServiceConfig;
use error::Result;
use health::{AutoRecovery, HealthChecker};
use manager::LifecycleManager;
use models::HealthStatus;
use proxy::{ProxyConfig, ProxyService};
use reload::HotReloadEngine;
use resources::{GpuMonitor, GpuProbe, ResourceScheduler, SchedulerConfig};
use shutdown::ShutdownCoordinator;
use store::ConfigStore;
use telemetry::MetricsStore;

/// Component-level knobs beyond the service configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub scheduler: SchedulerConfig,
    pub proxy: ProxyConfig,
}

/// The orchestrator instance: every component, wired.
pub struct Orchestrator {
    pub config: ServiceConfig,
    pub store: Arc<dyn ConfigStore>,
    pub probe: Arc<dyn GpuProbe>,
    pub scheduler: Arc<ResourceScheduler>,
    pub manager: Arc<LifecycleManager>,
    pub checker: HealthChecker,
    pub recovery: Arc<AutoRecovery>,
    pub reload: Arc<HotReloadEngine>,
    pub proxy: Arc<ProxyService>,
    pub metrics: Arc<MetricsStore>,
    pub shutdown: Arc<ShutdownCoordinator>,
    gpu_monitor: parking_lot::Mutex<Option<GpuMonitor>>,
    started_at: Instant,
}

impl Orchestrator {
    /// Build and wire all components.
    ///
    /// The store, GPU probe and adapter registry are injected so
    /// deployments (and tests) can substitute their own.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ConfigStore>,
        probe: Arc<dyn GpuProbe>,
        adapters: AdapterRegistry,
        options: OrchestratorOptions,
    ) -> Arc<Self> {
        let scheduler = Arc::new(ResourceScheduler::new(probe.clone(), options.scheduler));
        let manager = Arc::new(LifecycleManager::new(adapters, scheduler.clone(), store.clone()));
        let proxy = Arc::new(ProxyService::new(options.proxy));
        let checker = HealthChecker::new();
        let recovery = Arc::new(AutoRecovery::new(manager.clone()));
        let reload = Arc::new(HotReloadEngine::new(
            store.clone(),
            manager.clone(),
            config.reload_interval,
        ));

        Self::wire(&manager, &proxy, &checker, &recovery);

        Arc::new(Self {
            config,
            store,
            probe,
            scheduler,
            manager,
            checker,
            recovery,
            reload,
            proxy,
            metrics: Arc::new(MetricsStore::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            gpu_monitor: parking_lot::Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    /// Default adapter registry honoring the configured launch budgets.
    pub fn default_adapters(config: &ServiceConfig) -> AdapterRegistry {
        AdapterRegistry::with_defaults(AdapterTimeouts {
            startup: config.startup_timeout,
            stop: config.stop_timeout,
        })
    }

    /// Connect the event flows between components:
    /// manager -> proxy/health (instance registration), health -> manager
    /// and proxy (status mirrors), health -> recovery (restart loop).
    fn wire(
        manager: &Arc<LifecycleManager>,
        proxy: &Arc<ProxyService>,
        checker: &HealthChecker,
        recovery: &Arc<AutoRecovery>,
    ) {
        manager.add_instance_observer(proxy.clone());
        manager.add_instance_observer(Arc::new(checker.clone()));

        {
            let proxy = proxy.clone();
            manager.add_status_listener(Arc::new(move |model_id, _old, new| {
                proxy.registry().update_status(model_id, new);
            }));
        }

        {
            let manager = manager.clone();
            let proxy = proxy.clone();
            let recovery = recovery.clone();
            checker.add_transition_callback(Arc::new(move |model_id, _old, new, _result| {
                proxy.registry().update_health(model_id, new);
                if new == HealthStatus::Healthy {
                    recovery.handle_recovered(model_id);
                }
                let manager = manager.clone();
                let model_id = model_id.to_string();
                tokio::spawn(async move {
                    manager.update_health(&model_id, new).await;
                });
            }));
        }

        {
            let recovery = recovery.clone();
            checker.add_degraded_callback(Arc::new(move |model_id| {
                recovery.handle_degraded(model_id);
            }));
        }
    }

    /// Load persisted state and launch the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.manager.initialize().await?;
        self.reload.start().await?;
        self.proxy.start_sweep(Duration::from_secs(60));

        if self.config.metrics_enabled {
            let metrics = self.metrics.clone();
            let monitor =
                GpuMonitor::start(self.probe.clone(), Duration::from_secs(30), move |gpus| {
                    for gpu in &gpus {
                        let device = gpu.device_id;
                        metrics.set_gauge(
                            &format!("gpu{device}_memory_free_mib"),
                            gpu.memory_free as f64,
                        );
                        metrics.set_gauge(
                            &format!("gpu{device}_utilization"),
                            gpu.utilization as f64,
                        );
                    }
                });
            *self.gpu_monitor.lock() = Some(monitor);
        }

        tracing::info!("orchestrator started");
        Ok(())
    }

    /// Stop background loops and every running model, then drain.
    pub async fn stop(&self) {
        tracing::info!("orchestrator shutting down");
        self.shutdown.initiate(self.config.shutdown_timeout).await;
        self.gpu_monitor.lock().take();
        self.reload.stop();
        self.proxy.stop();
        self.recovery.shutdown();
        self.checker.stop_all();
        self.manager.shutdown().await;
        tracing::info!("orchestrator stopped");
    }

    /// Seconds since this instance was constructed.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
