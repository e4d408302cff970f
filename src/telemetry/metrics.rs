//! Orchestrator metrics: facade recorders plus an exportable store.
//!
//! The `metrics` facade feeds whatever exporter the deployment installs;
//! the `MetricsStore` keeps counter values in-process so the monitoring
//! endpoints can serve snapshots without an exporter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::models::{HealthStatus, ModelStatus};

/// Record a lifecycle state transition.
pub fn record_lifecycle_transition(model_id: &str, to: ModelStatus) {
    metrics::counter!(
        "orchestrator_lifecycle_transitions_total",
        "model_id" => model_id.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record one health probe outcome and its latency.
pub fn record_health_check(model_id: &str, status: HealthStatus, response_secs: Option<f64>) {
    metrics::counter!(
        "orchestrator_health_checks_total",
        "model_id" => model_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    if let Some(secs) = response_secs {
        metrics::histogram!(
            "orchestrator_health_check_seconds",
            "model_id" => model_id.to_string()
        )
        .record(secs);
    }
}

/// Record a recovery-driven restart attempt.
pub fn record_restart(model_id: &str, attempt: u32) {
    metrics::counter!(
        "orchestrator_restarts_total",
        "model_id" => model_id.to_string()
    )
    .increment(1);
    metrics::gauge!(
        "orchestrator_restart_attempt",
        "model_id" => model_id.to_string()
    )
    .set(attempt as f64);
}

/// Record one proxied request and its upstream status class.
pub fn record_proxy_request(model_id: &str, status: u16) {
    metrics::counter!(
        "orchestrator_proxy_requests_total",
        "model_id" => model_id.to_string(),
        "class" => format!("{}xx", status / 100)
    )
    .increment(1);
}

/// Snapshot of stored metric values at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
}

/// Thread-safe counter/gauge store for API export.
pub struct MetricsStore {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>, // f64 bits stored as u64
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// Increment a named counter, creating it at zero if absent.
    pub fn increment(&self, name: &str, delta: u64) {
        {
            let counters = self.counters.read().expect("metrics lock poisoned");
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().expect("metrics lock poisoned");
        counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a named gauge.
    pub fn set_gauge(&self, name: &str, value: f64) {
        {
            let gauges = self.gauges.read().expect("metrics lock poisoned");
            if let Some(gauge) = gauges.get(name) {
                gauge.store(f64::to_bits(value), Ordering::Relaxed);
                return;
            }
        }
        let mut gauges = self.gauges.write().expect("metrics lock poisoned");
        gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(f64::to_bits(value), Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .expect("metrics lock poisoned")
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .read()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), f64::from_bits(v.load(Ordering::Relaxed))))
            .collect();
        MetricsSnapshot { counters, gauges }
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}
