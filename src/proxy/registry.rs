//! Endpoint registry keyed by model id.
//!
//! Status and health are stored as atomics so routing reads never take a
//! lock; exact consistency is not required for balancing decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::models::{HealthStatus, ModelStatus};

fn status_to_u8(status: ModelStatus) -> u8 {
    match status {
        ModelStatus::Stopped => 0,
        ModelStatus::Starting => 1,
        ModelStatus::Running => 2,
        ModelStatus::Stopping => 3,
        ModelStatus::Error => 4,
    }
}

fn status_from_u8(value: u8) -> ModelStatus {
    match value {
        1 => ModelStatus::Starting,
        2 => ModelStatus::Running,
        3 => ModelStatus::Stopping,
        4 => ModelStatus::Error,
        _ => ModelStatus::Stopped,
    }
}

fn health_to_u8(health: HealthStatus) -> u8 {
    match health {
        HealthStatus::Unknown => 0,
        HealthStatus::Healthy => 1,
        HealthStatus::Unhealthy => 2,
    }
}

fn health_from_u8(value: u8) -> HealthStatus {
    match value {
        1 => HealthStatus::Healthy,
        2 => HealthStatus::Unhealthy,
        _ => HealthStatus::Unknown,
    }
}

pub(crate) struct EndpointEntry {
    pub base_url: String,
    status: AtomicU8,
    health: AtomicU8,
    pub connections: AtomicU32,
    pub requests: AtomicU64,
    last_updated: parking_lot::Mutex<DateTime<Utc>>,
    last_health_check: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl EndpointEntry {
    pub fn status(&self) -> ModelStatus {
        status_from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn health(&self) -> HealthStatus {
        health_from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn is_available(&self) -> bool {
        self.status() == ModelStatus::Running && self.health() == HealthStatus::Healthy
    }
}

/// Public view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointRecord {
    pub model_id: String,
    pub base_url: String,
    pub status: ModelStatus,
    pub health: HealthStatus,
    pub connection_count: u32,
    pub request_count: u64,
    pub last_updated: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Thread-safe endpoint table.
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<EndpointEntry>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }

    /// Insert or replace an endpoint.
    pub fn register(
        &self,
        model_id: &str,
        base_url: &str,
        status: ModelStatus,
        health: HealthStatus,
    ) {
        let entry = Arc::new(EndpointEntry {
            base_url: base_url.to_string(),
            status: AtomicU8::new(status_to_u8(status)),
            health: AtomicU8::new(health_to_u8(health)),
            connections: AtomicU32::new(0),
            requests: AtomicU64::new(0),
            last_updated: parking_lot::Mutex::new(Utc::now()),
            last_health_check: parking_lot::Mutex::new(None),
        });
        self.endpoints.insert(model_id.to_string(), entry);
        tracing::debug!(model_id, base_url, "endpoint registered");
    }

    pub fn unregister(&self, model_id: &str) {
        if self.endpoints.remove(model_id).is_some() {
            tracing::debug!(model_id, "endpoint unregistered");
        }
    }

    pub fn update_status(&self, model_id: &str, status: ModelStatus) {
        if let Some(entry) = self.endpoints.get(model_id) {
            entry.status.store(status_to_u8(status), Ordering::Relaxed);
            *entry.last_updated.lock() = Utc::now();
        }
    }

    pub fn update_health(&self, model_id: &str, health: HealthStatus) {
        if let Some(entry) = self.endpoints.get(model_id) {
            entry.health.store(health_to_u8(health), Ordering::Relaxed);
            *entry.last_health_check.lock() = Some(Utc::now());
        }
    }

    pub(crate) fn entry(&self, model_id: &str) -> Option<Arc<EndpointEntry>> {
        self.endpoints.get(model_id).map(|e| e.value().clone())
    }

    /// Registered AND RUNNING AND HEALTHY, id-sorted for deterministic
    /// balancing.
    pub(crate) fn available(&self) -> Vec<(String, Arc<EndpointEntry>)> {
        let mut available: Vec<(String, Arc<EndpointEntry>)> = self
            .endpoints
            .iter()
            .filter(|e| e.value().is_available())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        available.sort_by(|a, b| a.0.cmp(&b.0));
        available
    }

    /// Ids of available endpoints.
    pub fn available_ids(&self) -> Vec<String> {
        self.available().into_iter().map(|(id, _)| id).collect()
    }

    fn record_of(model_id: &str, entry: &EndpointEntry) -> EndpointRecord {
        EndpointRecord {
            model_id: model_id.to_string(),
            base_url: entry.base_url.clone(),
            status: entry.status(),
            health: entry.health(),
            connection_count: entry.connections.load(Ordering::Relaxed),
            request_count: entry.requests.load(Ordering::Relaxed),
            last_updated: *entry.last_updated.lock(),
            last_health_check: *entry.last_health_check.lock(),
        }
    }

    pub fn get(&self, model_id: &str) -> Option<EndpointRecord> {
        self.endpoints
            .get(model_id)
            .map(|entry| Self::record_of(model_id, &entry))
    }

    pub fn records(&self) -> Vec<EndpointRecord> {
        let mut records: Vec<EndpointRecord> = self
            .endpoints
            .iter()
            .map(|e| Self::record_of(e.key(), e.value()))
            .collect();
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        records
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard tracking one in-flight proxied request.
pub struct ConnectionGuard {
    entry: Arc<EndpointEntry>,
}

impl ConnectionGuard {
    pub(crate) fn acquire(entry: Arc<EndpointEntry>) -> Self {
        entry.connections.fetch_add(1, Ordering::SeqCst);
        Self { entry }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.entry.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_availability() {
        let registry = EndpointRegistry::new();
        registry.register(
            "m1",
            "http://127.0.0.1:8001",
            ModelStatus::Running,
            HealthStatus::Healthy,
        );
        registry.register(
            "m2",
            "http://127.0.0.1:8002",
            ModelStatus::Running,
            HealthStatus::Unhealthy,
        );
        registry.register(
            "m3",
            "http://127.0.0.1:8003",
            ModelStatus::Stopped,
            HealthStatus::Healthy,
        );

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.available_ids(), vec!["m1"]);
    }

    #[test]
    fn test_status_and_health_updates() {
        let registry = EndpointRegistry::new();
        registry.register(
            "m1",
            "http://127.0.0.1:8001",
            ModelStatus::Running,
            HealthStatus::Healthy,
        );

        registry.update_health("m1", HealthStatus::Unhealthy);
        assert!(registry.available_ids().is_empty());
        let record = registry.get("m1").unwrap();
        assert_eq!(record.health, HealthStatus::Unhealthy);
        assert!(record.last_health_check.is_some());

        registry.update_health("m1", HealthStatus::Healthy);
        registry.update_status("m1", ModelStatus::Stopping);
        assert!(registry.available_ids().is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry = EndpointRegistry::new();
        registry.register(
            "m1",
            "http://127.0.0.1:8001",
            ModelStatus::Running,
            HealthStatus::Healthy,
        );
        registry.unregister("m1");
        assert!(registry.get("m1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connection_guard_tracks_in_flight() {
        let registry = EndpointRegistry::new();
        registry.register(
            "m1",
            "http://127.0.0.1:8001",
            ModelStatus::Running,
            HealthStatus::Healthy,
        );
        let entry = registry.entry("m1").unwrap();

        let g1 = ConnectionGuard::acquire(entry.clone());
        let g2 = ConnectionGuard::acquire(entry.clone());
        assert_eq!(registry.get("m1").unwrap().connection_count, 2);

        drop(g1);
        assert_eq!(registry.get("m1").unwrap().connection_count, 1);
        drop(g2);
        assert_eq!(registry.get("m1").unwrap().connection_count, 0);
    }
}
