//! Configuration hot reload.
//!
//! Polls the config store, diffs against an in-memory cache, and drives
//! the lifecycle manager: live-applicable changes take effect in place,
//! structural changes stop-apply-start the model. The poll cycle is
//! single-flight; a tick that fires while the previous cycle still runs
//! is dropped.

mod diff;

pub use diff::{change_fields, configs_differ, requires_restart};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};
use crate::manager::LifecycleManager;
use crate::models::ModelConfig;
use crate::store::ConfigStore;

/// Kind of configuration change detected by a reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigChangeType {
    Created,
    Updated,
    Deleted,
}

/// One detected configuration change.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigChangeEvent {
    pub change_type: ConfigChangeType,
    pub model_id: String,
    pub old_config: Option<ModelConfig>,
    pub new_config: Option<ModelConfig>,
    pub timestamp: DateTime<Utc>,
    /// Dotted paths of changed fields; empty unless UPDATED.
    pub change_fields: BTreeSet<String>,
}

impl ConfigChangeEvent {
    fn created(config: ModelConfig) -> Self {
        Self {
            change_type: ConfigChangeType::Created,
            model_id: config.id.clone(),
            old_config: None,
            new_config: Some(config),
            timestamp: Utc::now(),
            change_fields: BTreeSet::new(),
        }
    }

    fn updated(old: ModelConfig, new: ModelConfig) -> Self {
        let fields = change_fields(&old, &new);
        Self {
            change_type: ConfigChangeType::Updated,
            model_id: new.id.clone(),
            old_config: Some(old),
            new_config: Some(new),
            timestamp: Utc::now(),
            change_fields: fields,
        }
    }

    fn deleted(old: ModelConfig) -> Self {
        Self {
            change_type: ConfigChangeType::Deleted,
            model_id: old.id.clone(),
            old_config: Some(old),
            new_config: None,
            timestamp: Utc::now(),
            change_fields: BTreeSet::new(),
        }
    }

    /// True when applying this event needs a model restart.
    pub fn requires_restart(&self) -> bool {
        match self.change_type {
            ConfigChangeType::Updated => requires_restart(&self.change_fields),
            ConfigChangeType::Created | ConfigChangeType::Deleted => false,
        }
    }
}

/// Change subscriber: synchronous callback or bounded async queue.
enum ChangeListener {
    Sync(Arc<dyn Fn(&ConfigChangeEvent) + Send + Sync>),
    Async(mpsc::Sender<ConfigChangeEvent>),
}

/// Engine status report for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    pub running: bool,
    pub enabled: bool,
    pub auto_apply_changes: bool,
    pub check_interval_secs: u64,
    pub cached_configs_count: usize,
    pub listeners_count: usize,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Config hot-reload engine.
pub struct HotReloadEngine {
    store: Arc<dyn ConfigStore>,
    manager: Arc<LifecycleManager>,
    cache: tokio::sync::RwLock<HashMap<String, ModelConfig>>,
    listeners: parking_lot::RwLock<Vec<ChangeListener>>,
    enabled: AtomicBool,
    auto_apply: AtomicBool,
    running: AtomicBool,
    busy: AtomicBool,
    interval_secs: AtomicU64,
    last_check: parking_lot::Mutex<Option<DateTime<Utc>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HotReloadEngine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        manager: Arc<LifecycleManager>,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            manager,
            cache: tokio::sync::RwLock::new(HashMap::new()),
            listeners: parking_lot::RwLock::new(Vec::new()),
            enabled: AtomicBool::new(true),
            auto_apply: AtomicBool::new(true),
            running: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            interval_secs: AtomicU64::new(check_interval.as_secs().max(1)),
            last_check: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Prime the cache and launch the poll loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.initialize_cache().await?;
        self.running.store(true, Ordering::SeqCst);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while engine.running.load(Ordering::SeqCst) {
                let interval = engine.interval_secs.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(interval)).await;
                if !engine.enabled.load(Ordering::SeqCst) {
                    continue;
                }
                if engine.busy.swap(true, Ordering::SeqCst) {
                    tracing::debug!("reload tick dropped: previous cycle still running");
                    continue;
                }
                if let Err(e) = engine.check_cycle().await {
                    // Transient store errors retry on the next tick.
                    tracing::warn!(error = %e, "reload cycle failed");
                }
                engine.busy.store(false, Ordering::SeqCst);
            }
        });
        *self.task.lock() = Some(handle);
        tracing::info!("hot reload engine started");
        Ok(())
    }

    /// Stop the poll loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn initialize_cache(&self) -> Result<()> {
        let configs = self.store.load_model_configs().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for config in configs {
            cache.insert(config.id.clone(), config);
        }
        tracing::info!(count = cache.len(), "reload cache initialized");
        Ok(())
    }

    /// One full diff pass over the store. Public for tests and for the
    /// manual reload endpoint.
    pub async fn check_cycle(&self) -> Result<Vec<ConfigChangeEvent>> {
        let configs = self.store.load_model_configs().await?;
        *self.last_check.lock() = Some(Utc::now());

        let mut events = Vec::new();
        {
            let mut cache = self.cache.write().await;
            let mut seen: BTreeSet<String> = BTreeSet::new();

            for config in configs {
                seen.insert(config.id.clone());
                match cache.get(&config.id) {
                    None => {
                        events.push(ConfigChangeEvent::created(config.clone()));
                        cache.insert(config.id.clone(), config);
                    }
                    Some(cached) if configs_differ(cached, &config) => {
                        events.push(ConfigChangeEvent::updated(cached.clone(), config.clone()));
                        cache.insert(config.id.clone(), config);
                    }
                    Some(_) => {}
                }
            }

            let removed: Vec<String> = cache
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            for id in removed {
                if let Some(old) = cache.remove(&id) {
                    events.push(ConfigChangeEvent::deleted(old));
                }
            }
        }

        for event in &events {
            self.notify_listeners(event);
            if self.auto_apply.load(Ordering::SeqCst) {
                if let Err(e) = self.apply(event).await {
                    tracing::warn!(
                        model_id = %event.model_id,
                        error = %e,
                        "failed to apply config change"
                    );
                }
            }
        }
        Ok(events)
    }

    /// Re-check a single model against the store.
    pub async fn reload_model_config(&self, model_id: &str) -> Result<Option<ConfigChangeEvent>> {
        let configs = self.store.load_model_configs().await?;
        let fresh = configs.into_iter().find(|c| c.id == model_id);

        let event = {
            let mut cache = self.cache.write().await;
            match (cache.get(model_id).cloned(), fresh) {
                (None, Some(config)) => {
                    cache.insert(model_id.to_string(), config.clone());
                    Some(ConfigChangeEvent::created(config))
                }
                (Some(cached), Some(config)) if configs_differ(&cached, &config) => {
                    cache.insert(model_id.to_string(), config.clone());
                    Some(ConfigChangeEvent::updated(cached, config))
                }
                (Some(cached), None) => {
                    cache.remove(model_id);
                    Some(ConfigChangeEvent::deleted(cached))
                }
                _ => None,
            }
        };

        if let Some(event) = &event {
            self.notify_listeners(event);
            if self.auto_apply.load(Ordering::SeqCst) {
                self.apply(event).await?;
            }
        }
        Ok(event)
    }

    /// Drive the lifecycle manager for one change event.
    async fn apply(&self, event: &ConfigChangeEvent) -> Result<()> {
        match event.change_type {
            ConfigChangeType::Created => {
                let config = event
                    .new_config
                    .clone()
                    .ok_or_else(|| OrchestratorError::Internal("created event without config".into()))?;
                match self.manager.create(config).await {
                    // The manager itself persisted this config; the event
                    // only confirms what we already track.
                    Ok(_) | Err(OrchestratorError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ConfigChangeType::Updated => {
                let config = event
                    .new_config
                    .clone()
                    .ok_or_else(|| OrchestratorError::Internal("updated event without config".into()))?;
                self.manager
                    .update_config(&event.model_id, config, true)
                    .await?;
                Ok(())
            }
            ConfigChangeType::Deleted => match self.manager.delete(&event.model_id).await {
                Ok(()) | Err(OrchestratorError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    fn notify_listeners(&self, event: &ConfigChangeEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            match listener {
                ChangeListener::Sync(callback) => callback(event),
                ChangeListener::Async(sender) => {
                    if let Err(e) = sender.try_send(event.clone()) {
                        tracing::warn!(
                            model_id = %event.model_id,
                            error = %e,
                            "async change listener queue full; event dropped"
                        );
                    }
                }
            }
        }
    }

    /// Subscribe with a synchronous callback.
    pub fn add_change_listener(&self, listener: Arc<dyn Fn(&ConfigChangeEvent) + Send + Sync>) {
        self.listeners.write().push(ChangeListener::Sync(listener));
    }

    /// Subscribe with a bounded queue; events overflowing it are dropped.
    pub fn add_async_listener(&self, capacity: usize) -> mpsc::Receiver<ConfigChangeEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.listeners.write().push(ChangeListener::Async(tx));
        rx
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Update the poll interval; zero is rejected and keeps the old value.
    pub fn set_check_interval(&self, secs: u64) {
        if secs == 0 {
            tracing::warn!("ignoring non-positive reload interval");
            return;
        }
        self.interval_secs.store(secs, Ordering::SeqCst);
    }

    pub fn set_auto_apply(&self, auto_apply: bool) {
        self.auto_apply.store(auto_apply, Ordering::SeqCst);
    }

    pub async fn get_cached_config(&self, model_id: &str) -> Option<ModelConfig> {
        self.cache.read().await.get(model_id).cloned()
    }

    pub async fn get_all_cached_configs(&self) -> HashMap<String, ModelConfig> {
        self.cache.read().await.clone()
    }

    pub async fn status(&self) -> ReloadStatus {
        ReloadStatus {
            running: self.running.load(Ordering::SeqCst),
            enabled: self.enabled.load(Ordering::SeqCst),
            auto_apply_changes: self.auto_apply.load(Ordering::SeqCst),
            check_interval_secs: self.interval_secs.load(Ordering::SeqCst),
            cached_configs_count: self.cache.read().await.len(),
            listeners_count: self.listeners.read().len(),
            last_check_time: *self.last_check.lock(),
        }
    }
}
