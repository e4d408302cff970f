//! Model lifecycle management.
//!
//! The manager owns the authoritative `id -> ModelRuntime` map and the
//! state machine STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
//! (ERROR on failure). A per-model mutex serializes conflicting operations;
//! the registry lock is never held across an adapter call. Status-change
//! listeners fire after the transition commits, outside any lock.

mod runtime;

pub use runtime::ModelRuntime;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::adapters::{AdapterRegistry, FrameworkAdapter};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    HealthStatus, ModelConfig, ModelInfo, ModelStatus, ValidationReport,
};
use crate::reload::{change_fields, requires_restart};
use crate::resources::{calculator, ResourceScheduler, ScheduleOutcome};
use crate::store::ConfigStore;
use crate::telemetry::record_lifecycle_transition;

/// Status-change listener: `(model_id, old, new)`.
pub type StatusListener = Arc<dyn Fn(&str, ModelStatus, ModelStatus) + Send + Sync>;

/// Receives instance start/stop notifications.
///
/// The proxy registry and the health checker implement this; the manager
/// notifies them when an instance reaches RUNNING and before it is
/// stopped, so no traffic is routed to a dying instance. Notifications
/// are awaited: registration is complete when the operation returns.
#[async_trait::async_trait]
pub trait InstanceObserver: Send + Sync {
    async fn instance_started(&self, config: &ModelConfig, endpoint: &str);
    async fn instance_stopped(&self, model_id: &str);
}

/// Outcome of a config update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    /// The change set touched fields that require a restart.
    pub requires_restart: bool,
    /// A restart was actually performed in this call.
    pub restarted: bool,
}

/// Authoritative registry and state machine for all models.
pub struct LifecycleManager {
    adapters: AdapterRegistry,
    scheduler: Arc<ResourceScheduler>,
    store: Arc<dyn ConfigStore>,
    runtimes: RwLock<HashMap<String, ModelRuntime>>,
    op_locks: DashMap<String, Arc<Mutex<()>>>,
    listeners: parking_lot::RwLock<Vec<StatusListener>>,
    observers: parking_lot::RwLock<Vec<Arc<dyn InstanceObserver>>>,
}

impl LifecycleManager {
    pub fn new(
        adapters: AdapterRegistry,
        scheduler: Arc<ResourceScheduler>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            adapters,
            scheduler,
            store,
            runtimes: RwLock::new(HashMap::new()),
            op_locks: DashMap::new(),
            listeners: parking_lot::RwLock::new(Vec::new()),
            observers: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Seed runtimes from every active config in the store.
    pub async fn initialize(&self) -> Result<usize> {
        let configs = self.store.load_model_configs().await?;
        let mut runtimes = self.runtimes.write().await;
        let mut seeded = 0;
        for config in configs {
            if runtimes.contains_key(&config.id) {
                continue;
            }
            self.scheduler.register(&config);
            runtimes.insert(config.id.clone(), ModelRuntime::new(config));
            seeded += 1;
        }
        tracing::info!(count = seeded, "lifecycle manager initialized from store");
        Ok(seeded)
    }

    /// Subscribe to status transitions.
    pub fn add_status_listener(&self, listener: StatusListener) {
        self.listeners.write().push(listener);
    }

    /// Attach an instance observer (proxy registry, health checker).
    pub fn add_instance_observer(&self, observer: Arc<dyn InstanceObserver>) {
        self.observers.write().push(observer);
    }

    fn op_lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Commit a status change and report it to listeners outside the lock.
    async fn transition(&self, model_id: &str, new_status: ModelStatus) -> Result<()> {
        let old_status = {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes
                .get_mut(model_id)
                .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))?;
            let old = runtime.status;
            runtime.status = new_status;
            old
        };

        if old_status != new_status {
            tracing::info!(model_id, from = %old_status, to = %new_status, "status transition");
            record_lifecycle_transition(model_id, new_status);
            let listeners: Vec<StatusListener> = self.listeners.read().clone();
            for listener in listeners {
                listener(model_id, old_status, new_status);
            }
        }
        Ok(())
    }

    async fn notify_started(&self, config: &ModelConfig, endpoint: &str) {
        let observers: Vec<_> = self.observers.read().clone();
        for observer in observers {
            observer.instance_started(config, endpoint).await;
        }
    }

    async fn notify_stopped(&self, model_id: &str) {
        let observers: Vec<_> = self.observers.read().clone();
        for observer in observers {
            observer.instance_stopped(model_id).await;
        }
    }

    /// Validate a config through schema, store, and adapter passes.
    ///
    /// Omitted resource requirements are estimated first, exactly as
    /// `create` would resolve them.
    pub async fn validate(&self, config: &ModelConfig) -> Result<ValidationReport> {
        let mut config = config.clone();
        if config.resource_requirements.gpu_memory == 0 {
            config.resource_requirements = calculator::estimate(&config);
        }

        let mut report = config.validate_schema();
        report.merge(self.store.validate_config(&config).await);

        let adapter = self.adapters.get(config.framework)?;
        let snapshot = self.scheduler.effective_snapshot().await.unwrap_or_default();
        report.merge(adapter.validate(&config, &snapshot).await);
        Ok(report)
    }

    /// Register a new model: validate, persist, seed STOPPED runtime.
    ///
    /// Atomic: the runtime is only seeded after the store accepted the
    /// config, and a persist failure leaves no trace.
    pub async fn create(&self, mut config: ModelConfig) -> Result<String> {
        let lock = self.op_lock(&config.id);
        let _guard = lock.lock().await;

        if self.runtimes.read().await.contains_key(&config.id) {
            return Err(OrchestratorError::AlreadyExists(config.id));
        }

        if config.resource_requirements.gpu_memory == 0 {
            config.resource_requirements = calculator::estimate(&config);
        }

        let report = self.validate(&config).await?;
        if !report.is_valid {
            return Err(OrchestratorError::InvalidConfig(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            tracing::warn!(model_id = %config.id, warning = %warning, "config warning");
        }

        self.store.save_model_config(&config).await?;
        self.scheduler.register(&config);
        self.runtimes
            .write()
            .await
            .insert(config.id.clone(), ModelRuntime::new(config.clone()));

        tracing::info!(model_id = %config.id, "model created");
        Ok(config.id)
    }

    /// Remove a model, stopping it first when running.
    pub async fn delete(&self, model_id: &str) -> Result<()> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;

        let status = self.status_of(model_id).await?;
        if matches!(status, ModelStatus::Running | ModelStatus::Starting) {
            self.stop_locked(model_id).await?;
        }

        self.runtimes.write().await.remove(model_id);
        self.scheduler.unregister(model_id);
        self.op_locks.remove(model_id);
        self.notify_stopped(model_id).await;

        // The store row may already be inactive (hot-reload driven delete).
        match self.store.delete_model_config(model_id).await {
            Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(model_id, "model deleted");
        Ok(())
    }

    /// Start a model. Idempotent when already RUNNING.
    pub async fn start(&self, model_id: &str) -> Result<()> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;
        self.start_locked(model_id).await
    }

    async fn start_locked(&self, model_id: &str) -> Result<()> {
        let config = match self.status_of(model_id).await? {
            ModelStatus::Running => return Ok(()),
            ModelStatus::Starting | ModelStatus::Stopping => {
                return Err(OrchestratorError::Conflict(format!(
                    "model {model_id} is busy"
                )))
            }
            _ => self.config_of(model_id).await?,
        };

        self.transition(model_id, ModelStatus::Starting).await?;

        let allocation = match self.scheduler.schedule(model_id).await {
            Ok(ScheduleOutcome::Scheduled(allocation)) => allocation,
            Ok(ScheduleOutcome::InsufficientResources(errors)) => {
                match self.try_preempt_for(model_id).await? {
                    Some(allocation) => allocation,
                    None => {
                        // Not an instance failure: fall back to STOPPED,
                        // not ERROR.
                        self.transition(model_id, ModelStatus::Stopped).await?;
                        return Err(OrchestratorError::InsufficientResources(
                            errors.join("; "),
                        ));
                    }
                }
            }
            Err(e) => {
                self.transition(model_id, ModelStatus::Stopped).await?;
                return Err(e);
            }
        };

        let adapter = self.adapters.get(config.framework)?;
        match adapter.start(&config).await {
            Ok(instance) => {
                {
                    let mut runtimes = self.runtimes.write().await;
                    if let Some(runtime) = runtimes.get_mut(model_id) {
                        runtime.handle = Some(instance.handle.clone());
                        runtime.endpoint = Some(instance.endpoint.clone());
                        runtime.started_at = Some(Utc::now());
                        runtime.allocation = Some(allocation);
                    }
                }
                self.transition(model_id, ModelStatus::Running).await?;
                self.notify_started(&config, &instance.endpoint).await;
                Ok(())
            }
            Err(e) => {
                self.scheduler.release(model_id);
                self.transition(model_id, ModelStatus::Error).await?;
                // Best-effort cleanup of any partial instance state.
                let _ = adapter.stop(model_id).await;
                Err(e.into())
            }
        }
    }

    /// Under the preemption policy, evict a lower-priority model and try
    /// the placement again. Returns `None` when no plan applies (always,
    /// with the default non-preemptive policy).
    async fn try_preempt_for(
        &self,
        model_id: &str,
    ) -> Result<Option<crate::resources::ResourceAllocation>> {
        let plans = self.scheduler.reschedule().await?;
        let Some(plan) = plans.into_iter().find(|p| p.place_id == model_id) else {
            return Ok(None);
        };

        tracing::warn!(
            evict = %plan.evict_id,
            place = %plan.place_id,
            "preempting lower-priority model"
        );
        // Different id, so a distinct per-model lock: no deadlock with the
        // lock we hold for `model_id`.
        if let Err(e) = self.stop(&plan.evict_id).await {
            tracing::warn!(evict = %plan.evict_id, error = %e, "preemption stop failed");
            return Ok(None);
        }

        match self.scheduler.schedule(model_id).await? {
            ScheduleOutcome::Scheduled(allocation) => Ok(Some(allocation)),
            ScheduleOutcome::InsufficientResources(_) => Ok(None),
        }
    }

    /// Stop a model. Idempotent when already STOPPED.
    pub async fn stop(&self, model_id: &str) -> Result<()> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;
        self.stop_locked(model_id).await
    }

    async fn stop_locked(&self, model_id: &str) -> Result<()> {
        let config = match self.status_of(model_id).await? {
            ModelStatus::Stopped => return Ok(()),
            _ => self.config_of(model_id).await?,
        };

        self.transition(model_id, ModelStatus::Stopping).await?;
        // Unregister from routing and health checking before the instance
        // goes away.
        self.notify_stopped(model_id).await;

        let adapter = self.adapters.get(config.framework)?;
        let stop_result = adapter.stop(model_id).await;

        self.scheduler.release(model_id);
        {
            let mut runtimes = self.runtimes.write().await;
            if let Some(runtime) = runtimes.get_mut(model_id) {
                runtime.clear_instance();
            }
        }
        self.transition(model_id, ModelStatus::Stopped).await?;

        match stop_result {
            Ok(()) => Ok(()),
            Err(e) => {
                // Residual process state is reconciled by the adapter's
                // next probe; surface the failure to the caller anyway.
                tracing::warn!(model_id, error = %e, "stop reported failure");
                Err(e.into())
            }
        }
    }

    /// Stop a model and leave it in ERROR.
    ///
    /// Used by auto-recovery when the retry budget is exhausted: the
    /// instance is torn down but the status records that the model is not
    /// cleanly stopped.
    pub async fn mark_failed(&self, model_id: &str) -> Result<()> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;

        if let Err(e) = self.stop_locked(model_id).await {
            match e {
                OrchestratorError::NotFound(_) => return Err(e),
                other => tracing::warn!(model_id, error = %other, "stop during mark_failed"),
            }
        }
        self.transition(model_id, ModelStatus::Error).await
    }

    /// Restart: stop (failures tolerated) then start.
    pub async fn restart(&self, model_id: &str) -> Result<()> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;

        if let Err(e) = self.stop_locked(model_id).await {
            match e {
                OrchestratorError::NotFound(_) => return Err(e),
                other => {
                    tracing::warn!(model_id, error = %other, "stop failed during restart")
                }
            }
        }

        {
            let mut runtimes = self.runtimes.write().await;
            if let Some(runtime) = runtimes.get_mut(model_id) {
                runtime.restart_count += 1;
            }
        }

        self.start_locked(model_id).await
    }

    /// Replace a model's configuration.
    ///
    /// Live-applicable changes (name, priority, health check, retry
    /// policy) take effect immediately. Anything else requires a restart;
    /// pass `restart_if_needed = false` to defer it to the caller.
    pub async fn update_config(
        &self,
        model_id: &str,
        mut new_config: ModelConfig,
        restart_if_needed: bool,
    ) -> Result<UpdateOutcome> {
        let lock = self.op_lock(model_id);
        let _guard = lock.lock().await;

        if new_config.id != model_id {
            return Err(OrchestratorError::InvalidConfig(format!(
                "config id '{}' does not match path id '{model_id}'",
                new_config.id
            )));
        }

        let old_config = self.config_of(model_id).await?;
        if new_config.resource_requirements.gpu_memory == 0 {
            new_config.resource_requirements = calculator::estimate(&new_config);
        }
        let report = new_config.validate_schema();
        if !report.is_valid {
            return Err(OrchestratorError::InvalidConfig(report.errors.join("; ")));
        }

        // Creation time is immutable; normalize before diffing so only
        // semantic fields show up as changes.
        new_config.created_at = old_config.created_at;
        let changed = change_fields(&old_config, &new_config);
        let needs_restart = requires_restart(&changed);

        new_config.updated_at = Utc::now();
        self.store.save_model_config(&new_config).await?;
        self.scheduler.register(&new_config);
        {
            let mut runtimes = self.runtimes.write().await;
            if let Some(runtime) = runtimes.get_mut(model_id) {
                runtime.config = new_config;
            }
        }

        let was_running = self.status_of(model_id).await? == ModelStatus::Running;
        let mut restarted = false;
        if needs_restart && was_running && restart_if_needed {
            self.stop_locked(model_id).await?;
            self.start_locked(model_id).await?;
            restarted = true;
        }

        tracing::info!(
            model_id,
            fields = ?changed,
            needs_restart,
            restarted,
            "config updated"
        );
        Ok(UpdateOutcome {
            requires_restart: needs_restart,
            restarted,
        })
    }

    /// Record the latest health judgment for a model.
    pub async fn update_health(&self, model_id: &str, health: HealthStatus) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(model_id) {
            runtime.last_health = health;
        }
    }

    pub async fn get_status(&self, model_id: &str) -> Result<ModelStatus> {
        self.status_of(model_id).await
    }

    pub async fn get_health(&self, model_id: &str) -> Result<HealthStatus> {
        let runtimes = self.runtimes.read().await;
        runtimes
            .get(model_id)
            .map(|r| r.last_health)
            .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))
    }

    pub async fn get_config(&self, model_id: &str) -> Result<ModelConfig> {
        self.config_of(model_id).await
    }

    pub async fn get_info(&self, model_id: &str) -> Result<ModelInfo> {
        let runtimes = self.runtimes.read().await;
        runtimes
            .get(model_id)
            .map(ModelRuntime::info)
            .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))
    }

    /// All models, id-sorted.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let runtimes = self.runtimes.read().await;
        let mut infos: Vec<ModelInfo> = runtimes.values().map(ModelRuntime::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// All models ordered by priority.
    pub async fn list_by_priority(&self, descending: bool) -> Vec<ModelInfo> {
        let mut infos = self.list().await;
        infos.sort_by(|a, b| {
            if descending {
                b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
            } else {
                a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
            }
        });
        infos
    }

    /// Models currently RUNNING.
    pub async fn list_running(&self) -> Vec<ModelInfo> {
        let runtimes = self.runtimes.read().await;
        let mut infos: Vec<ModelInfo> = runtimes
            .values()
            .filter(|r| r.status == ModelStatus::Running)
            .map(ModelRuntime::info)
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn count(&self) -> usize {
        self.runtimes.read().await.len()
    }

    /// Stop every running model, best-effort, for service shutdown.
    ///
    /// Stops run concurrently (each under its own per-model lock) and
    /// this blocks until all of them settle.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .list_running()
            .await
            .into_iter()
            .map(|info| info.id)
            .collect();
        tracing::info!(count = running.len(), "shutting down running models");

        let stops = running.iter().map(|model_id| async move {
            if let Err(e) = self.stop(model_id).await {
                tracing::warn!(model_id = %model_id, error = %e, "shutdown stop failed");
            }
        });
        futures::future::join_all(stops).await;
    }

    async fn status_of(&self, model_id: &str) -> Result<ModelStatus> {
        let runtimes = self.runtimes.read().await;
        runtimes
            .get(model_id)
            .map(|r| r.status)
            .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))
    }

    async fn config_of(&self, model_id: &str) -> Result<ModelConfig> {
        let runtimes = self.runtimes.read().await;
        runtimes
            .get(model_id)
            .map(|r| r.config.clone())
            .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))
    }
}
