//! Periodic health probing of running model instances.
//!
//! Each registered model gets its own probe task. Results feed a bounded
//! ring history and a consecutive-failure counter; `max_failures`
//! consecutive failures emit exactly one degradation signal per episode.
//! Callbacks run outside the check loop's locks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::manager::InstanceObserver;
use crate::models::{HealthCheckConfig, HealthCheckResult, HealthStatus, ModelConfig};
use crate::telemetry::record_health_check;

/// Transition callback: `(model_id, old, new, result)`.
pub type TransitionCallback =
    Arc<dyn Fn(&str, HealthStatus, HealthStatus, &HealthCheckResult) + Send + Sync>;

/// Degradation callback: `max_failures` consecutive failures reached.
pub type DegradedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-model probe statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub model_id: String,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub success_rate: f64,
    pub avg_response_time: Option<f64>,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Current judgment plus bounded history for one model.
#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub model_id: String,
    pub endpoint: String,
    pub current_status: HealthStatus,
    pub failure_count: u32,
    pub check_history: Vec<HealthCheckResult>,
}

struct ModelEntry {
    endpoint: String,
    config: HealthCheckConfig,
    status: HealthStatus,
    failure_count: u32,
    degraded_emitted: bool,
    total_checks: u64,
    successful_checks: u64,
    history: VecDeque<HealthCheckResult>,
}

struct CheckerInner {
    http: reqwest::Client,
    max_history: usize,
    entries: RwLock<HashMap<String, ModelEntry>>,
    tasks: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    transition_callbacks: parking_lot::RwLock<Vec<TransitionCallback>>,
    degraded_callbacks: parking_lot::RwLock<Vec<DegradedCallback>>,
}

/// Health checker over all registered models.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_history_capacity(100)
    }

    pub fn with_history_capacity(max_history: usize) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                http: reqwest::Client::new(),
                max_history: max_history.max(1),
                entries: RwLock::new(HashMap::new()),
                tasks: parking_lot::Mutex::new(HashMap::new()),
                transition_callbacks: parking_lot::RwLock::new(Vec::new()),
                degraded_callbacks: parking_lot::RwLock::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to status transitions.
    pub fn add_transition_callback(&self, callback: TransitionCallback) {
        self.inner.transition_callbacks.write().push(callback);
    }

    /// Subscribe to degradation signals.
    pub fn add_degraded_callback(&self, callback: DegradedCallback) {
        self.inner.degraded_callbacks.write().push(callback);
    }

    /// Register a model and launch its probe task.
    pub async fn register_model(&self, model_id: &str, endpoint: &str, config: HealthCheckConfig) {
        let entry = ModelEntry {
            endpoint: endpoint.to_string(),
            config: config.clone(),
            status: HealthStatus::Unknown,
            failure_count: 0,
            degraded_emitted: false,
            total_checks: 0,
            successful_checks: 0,
            history: VecDeque::new(),
        };
        self.inner
            .entries
            .write()
            .await
            .insert(model_id.to_string(), entry);

        if !config.enabled {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let id = model_id.to_string();
        let endpoint = endpoint.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.interval.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first probe
            loop {
                let result = probe(
                    &inner.http,
                    &id,
                    &endpoint,
                    &config.endpoint,
                    Duration::from_secs(config.timeout.max(1)),
                )
                .await;
                record_result(&inner, result).await;
                ticker.tick().await;
            }
        });

        if let Some(previous) = self.inner.tasks.lock().insert(model_id.to_string(), handle) {
            previous.abort();
        }
        tracing::debug!(model_id, "health checks registered");
    }

    /// Remove a model and cancel its probe task.
    pub async fn unregister_model(&self, model_id: &str) {
        if let Some(handle) = self.inner.tasks.lock().remove(model_id) {
            handle.abort();
        }
        self.inner.entries.write().await.remove(model_id);
        tracing::debug!(model_id, "health checks unregistered");
    }

    /// One-shot probe against a model's endpoint, without recording.
    pub async fn check_model_health(
        &self,
        model_id: &str,
        endpoint: &str,
        health_endpoint: &str,
        timeout: Duration,
    ) -> HealthCheckResult {
        probe(&self.inner.http, model_id, endpoint, health_endpoint, timeout).await
    }

    /// Record a result as if a probe task produced it.
    ///
    /// Exposed so the lifecycle layer and tests can inject results.
    pub async fn record(&self, result: HealthCheckResult) {
        record_result(&self.inner, result).await;
    }

    pub async fn get_status(&self, model_id: &str) -> Option<HealthStatus> {
        self.inner
            .entries
            .read()
            .await
            .get(model_id)
            .map(|e| e.status)
    }

    pub async fn get_all_status(&self) -> HashMap<String, HealthStatus> {
        self.inner
            .entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.status))
            .collect()
    }

    pub async fn get_details(&self, model_id: &str) -> Option<HealthDetails> {
        let entries = self.inner.entries.read().await;
        entries.get(model_id).map(|e| HealthDetails {
            model_id: model_id.to_string(),
            endpoint: e.endpoint.clone(),
            current_status: e.status,
            failure_count: e.failure_count,
            check_history: e.history.iter().cloned().collect(),
        })
    }

    pub async fn get_statistics(&self, model_id: &str) -> Option<HealthStats> {
        let entries = self.inner.entries.read().await;
        entries.get(model_id).map(|e| {
            let failed = e.total_checks - e.successful_checks;
            let response_times: Vec<f64> = e
                .history
                .iter()
                .filter_map(|r| r.response_time)
                .collect();
            let avg_response_time = if response_times.is_empty() {
                None
            } else {
                Some(response_times.iter().sum::<f64>() / response_times.len() as f64)
            };
            HealthStats {
                model_id: model_id.to_string(),
                total_checks: e.total_checks,
                successful_checks: e.successful_checks,
                failed_checks: failed,
                success_rate: if e.total_checks > 0 {
                    e.successful_checks as f64 / e.total_checks as f64
                } else {
                    0.0
                },
                avg_response_time,
                last_check_time: e.history.back().map(|r| r.check_time),
            }
        })
    }

    /// Cancel every probe task.
    pub fn stop_all(&self) {
        let mut tasks = self.inner.tasks.lock();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InstanceObserver for HealthChecker {
    async fn instance_started(&self, config: &ModelConfig, endpoint: &str) {
        self.register_model(&config.id, endpoint, config.health_check.clone())
            .await;
    }

    async fn instance_stopped(&self, model_id: &str) {
        self.unregister_model(model_id).await;
    }
}

/// Execute one HTTP probe. 2xx is HEALTHY; everything else (non-2xx,
/// transport error, timeout) is UNHEALTHY.
async fn probe(
    http: &reqwest::Client,
    model_id: &str,
    endpoint: &str,
    health_endpoint: &str,
    timeout: Duration,
) -> HealthCheckResult {
    let url = format!("{}{}", endpoint.trim_end_matches('/'), health_endpoint);
    let started = std::time::Instant::now();

    match tokio::time::timeout(timeout, http.get(&url).send()).await {
        Ok(Ok(response)) => {
            let elapsed = started.elapsed().as_secs_f64();
            if response.status().is_success() {
                let mut result = HealthCheckResult::healthy(model_id, elapsed);
                if let Ok(serde_json::Value::Object(body)) =
                    response.json::<serde_json::Value>().await
                {
                    result.details = body;
                }
                result
            } else {
                HealthCheckResult::unhealthy(
                    model_id,
                    format!("unexpected status {}", response.status().as_u16()),
                    Some(elapsed),
                )
            }
        }
        Ok(Err(e)) => HealthCheckResult::unhealthy(model_id, e.to_string(), None),
        Err(_) => HealthCheckResult::unhealthy(
            model_id,
            format!("health check timeout after {}s", timeout.as_secs()),
            None,
        ),
    }
}

async fn record_result(inner: &Arc<CheckerInner>, result: HealthCheckResult) {
    let model_id = result.model_id.clone();
    let mut transition: Option<(HealthStatus, HealthStatus)> = None;
    let mut degraded = false;

    {
        let mut entries = inner.entries.write().await;
        let Some(entry) = entries.get_mut(&model_id) else {
            return; // unregistered between probe and record
        };

        entry.total_checks += 1;
        match result.status {
            HealthStatus::Healthy => {
                entry.successful_checks += 1;
                entry.failure_count = 0;
                entry.degraded_emitted = false;
            }
            HealthStatus::Unhealthy => {
                entry.failure_count += 1;
                if entry.failure_count >= entry.config.max_failures && !entry.degraded_emitted {
                    entry.degraded_emitted = true;
                    degraded = true;
                }
            }
            HealthStatus::Unknown => {}
        }

        if entry.status != result.status {
            transition = Some((entry.status, result.status));
            entry.status = result.status;
        }

        entry.history.push_back(result.clone());
        while entry.history.len() > inner.max_history {
            entry.history.pop_front();
        }
    }

    record_health_check(&model_id, result.status, result.response_time);

    // Callbacks fire after state is committed, outside the entry lock.
    if let Some((old, new)) = transition {
        let callbacks: Vec<TransitionCallback> = inner.transition_callbacks.read().clone();
        for callback in callbacks {
            callback(&model_id, old, new, &result);
        }
    }
    if degraded {
        tracing::warn!(model_id = %model_id, "model degraded: failure threshold reached");
        let callbacks: Vec<DegradedCallback> = inner.degraded_callbacks.read().clone();
        for callback in callbacks {
            callback(&model_id);
        }
    }
}
