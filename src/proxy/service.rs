//! Request proxying: dispatch, failover, and the local endpoint sweep.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};
use crate::manager::InstanceObserver;
use crate::models::{HealthStatus, ModelConfig, ModelStatus};
use crate::telemetry::record_proxy_request;

use super::balancer::{Candidate, LoadBalancer, LoadBalancingStrategy};
use super::rate_limit::RateLimiter;
use super::registry::{ConnectionGuard, EndpointEntry, EndpointRecord, EndpointRegistry};
use super::rules::RuleSet;

/// Proxy behavior knobs.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub strategy: LoadBalancingStrategy,
    pub enable_failover: bool,
    /// Upper bound on endpoints tried per failover dispatch.
    pub max_failover_attempts: usize,
    pub request_timeout: Duration,
    /// Per-probe timeout of the local endpoint sweep.
    pub sweep_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            enable_failover: true,
            max_failover_attempts: 3,
            request_timeout: Duration::from_secs(60),
            sweep_timeout: Duration::from_secs(3),
        }
    }
}

/// Response handed back to the transport layer.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    /// Model that served the request.
    pub model_id: String,
}

/// Aggregate proxy statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub total_endpoints: usize,
    pub available_endpoints: usize,
    pub total_requests: u64,
    pub total_connections: u32,
    pub model_stats: Vec<EndpointRecord>,
}

/// API proxy: endpoint registry + balancer + rules + rate limiting.
pub struct ProxyService {
    registry: Arc<EndpointRegistry>,
    balancer: LoadBalancer,
    rules: RuleSet,
    limiter: RateLimiter,
    http: reqwest::Client,
    config: ProxyConfig,
    sweep_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyService {
    pub fn new(config: ProxyConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry: Arc::new(EndpointRegistry::new()),
            balancer: LoadBalancer::new(config.strategy),
            rules: RuleSet::new(),
            limiter: RateLimiter::new(),
            http,
            config,
            sweep_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Pick the next endpoint under the configured strategy.
    pub fn select_endpoint(&self) -> Option<String> {
        let candidates: Vec<Candidate> = self
            .registry
            .available()
            .into_iter()
            .map(|(model_id, entry)| Candidate {
                connections: entry.connections.load(std::sync::atomic::Ordering::Relaxed),
                model_id,
            })
            .collect();
        self.balancer.pick(&candidates)
    }

    /// Proxy one request to a specific model.
    pub async fn proxy_request(
        &self,
        model_id: &str,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: &HashMap<String, String>,
    ) -> Result<ProxyResponse> {
        let entry = self
            .registry
            .entry(model_id)
            .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))?;
        if !entry.is_available() {
            return Err(OrchestratorError::Unhealthy(format!(
                "model {model_id} is not available"
            )));
        }
        if !self.limiter.check(model_id) {
            return Err(OrchestratorError::RateLimited(model_id.to_string()));
        }

        self.dispatch(model_id, &entry, path, method, body, headers)
            .await
    }

    /// Proxy with failover: iterate endpoints in balancer order until one
    /// answers. Transport errors and 5xx advance to the next candidate;
    /// a 4xx is the caller's problem and returns immediately.
    pub async fn proxy_request_with_failover(
        &self,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: &HashMap<String, String>,
    ) -> Result<ProxyResponse> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut rate_limited_only = true;
        let max_attempts = if self.config.enable_failover {
            self.config.max_failover_attempts
        } else {
            1
        };

        while tried.len() < max_attempts {
            let candidates: Vec<Candidate> = self
                .registry
                .available()
                .into_iter()
                .filter(|(id, _)| !tried.contains(id))
                .map(|(model_id, entry)| Candidate {
                    connections: entry.connections.load(std::sync::atomic::Ordering::Relaxed),
                    model_id,
                })
                .collect();
            let Some(model_id) = self.balancer.pick(&candidates) else {
                break;
            };
            tried.insert(model_id.clone());

            if !self.limiter.check(&model_id) {
                tracing::debug!(model_id = %model_id, "failover skipping rate-limited endpoint");
                continue;
            }
            rate_limited_only = false;

            let entry = match self.registry.entry(&model_id) {
                Some(entry) => entry,
                None => continue,
            };
            match self
                .dispatch(&model_id, &entry, path, method, body.clone(), headers)
                .await
            {
                Ok(response) if response.status >= 500 => {
                    tracing::warn!(
                        model_id = %model_id,
                        status = response.status,
                        "upstream error; failing over"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(model_id = %model_id, error = %e, "dispatch failed; failing over");
                }
            }
        }

        if !tried.is_empty() && rate_limited_only {
            return Err(OrchestratorError::RateLimited(
                "all available endpoints".to_string(),
            ));
        }
        Err(OrchestratorError::DependencyUnavailable(
            "no available endpoint answered".to_string(),
        ))
    }

    /// Route a request through the rule table. The `{model_id}` parameter,
    /// when present, pins the target model; otherwise the balancer picks.
    pub async fn route_request(
        &self,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: &HashMap<String, String>,
    ) -> Result<ProxyResponse> {
        let (rule, params) = self
            .rules
            .match_rule(path, method)
            .ok_or_else(|| OrchestratorError::NotFound(format!("no proxy rule for {path}")))?;

        match params.get("model_id") {
            Some(model_id) => {
                self.proxy_request(model_id, &rule.target_path, method, body, headers)
                    .await
            }
            None => {
                self.proxy_request_with_failover(&rule.target_path, method, body, headers)
                    .await
            }
        }
    }

    async fn dispatch(
        &self,
        model_id: &str,
        entry: &Arc<EndpointEntry>,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: &HashMap<String, String>,
    ) -> Result<ProxyResponse> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| OrchestratorError::InvalidConfig(format!("bad method {method}")))?;
        let url = format!("{}{}", entry.base_url.trim_end_matches('/'), path);

        let _guard = ConnectionGuard::acquire(entry.clone());
        entry
            .requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut request = self.http.request(method, &url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OrchestratorError::DependencyUnavailable(e.to_string()))?;

        let status = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OrchestratorError::DependencyUnavailable(e.to_string()))?;
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));

        record_proxy_request(model_id, status);
        Ok(ProxyResponse {
            status,
            headers: response_headers,
            body,
            model_id: model_id.to_string(),
        })
    }

    /// Aggregate statistics over all registered endpoints.
    pub fn stats(&self) -> ProxyStats {
        let records = self.registry.records();
        ProxyStats {
            total_endpoints: records.len(),
            available_endpoints: self.registry.available_ids().len(),
            total_requests: records.iter().map(|r| r.request_count).sum(),
            total_connections: records.iter().map(|r| r.connection_count).sum(),
            model_stats: records,
        }
    }

    /// One pass of the local health sweep.
    ///
    /// Independent of the health checker: a failed probe marks the
    /// endpoint UNHEALTHY locally, and only the health checker re-asserts
    /// HEALTHY.
    pub async fn sweep_once(&self) {
        for record in self.registry.records() {
            if record.status != ModelStatus::Running {
                continue;
            }
            let url = format!("{}/health", record.base_url.trim_end_matches('/'));
            let probe = self.http.get(&url).timeout(self.config.sweep_timeout).send();
            match probe.await {
                Ok(response) if response.status().is_success() => {}
                _ => {
                    tracing::warn!(model_id = %record.model_id, "sweep marking endpoint unhealthy");
                    self.registry
                        .update_health(&record.model_id, HealthStatus::Unhealthy);
                }
            }
        }
    }

    /// Launch the periodic sweep task.
    pub fn start_sweep(self: &Arc<Self>, interval: Duration) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                service.sweep_once().await;
            }
        });
        if let Some(previous) = self.sweep_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the sweep task.
    pub fn stop(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl InstanceObserver for ProxyService {
    async fn instance_started(&self, config: &ModelConfig, endpoint: &str) {
        // Until the health checker asserts otherwise the endpoint is
        // unknown; with probes disabled it is trusted immediately.
        let health = if config.health_check.enabled {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };
        self.registry
            .register(&config.id, endpoint, ModelStatus::Running, health);

        if let Some(limit) = config.param_u64("requests_per_minute") {
            self.limiter.set_limit(&config.id, limit.min(u32::MAX as u64) as u32);
        }
    }

    async fn instance_stopped(&self, model_id: &str) {
        self.registry.unregister(model_id);
        self.limiter.clear_limit(model_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ProxyService {
        ProxyService::new(ProxyConfig::default())
    }

    fn register_available(svc: &ProxyService, id: &str, port: u16) {
        svc.registry().register(
            id,
            &format!("http://127.0.0.1:{port}"),
            ModelStatus::Running,
            HealthStatus::Healthy,
        );
    }

    #[test]
    fn test_select_endpoint_round_robin() {
        let svc = service();
        register_available(&svc, "a", 8001);
        register_available(&svc, "b", 8002);

        let picks: Vec<String> = (0..4).map(|_| svc.select_endpoint().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_select_skips_unavailable() {
        let svc = service();
        register_available(&svc, "a", 8001);
        register_available(&svc, "b", 8002);
        svc.registry().update_health("b", HealthStatus::Unhealthy);

        for _ in 0..3 {
            assert_eq!(svc.select_endpoint().unwrap(), "a");
        }
    }

    #[tokio::test]
    async fn test_proxy_request_unknown_model() {
        let svc = service();
        let err = svc
            .proxy_request("ghost", "/v1/chat", "POST", None, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_proxy_request_unavailable_model() {
        let svc = service();
        register_available(&svc, "a", 8001);
        svc.registry().update_health("a", HealthStatus::Unhealthy);

        let err = svc
            .proxy_request("a", "/v1/chat", "POST", None, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Unhealthy(_)));
    }

    #[tokio::test]
    async fn test_proxy_request_rate_limited() {
        let svc = service();
        register_available(&svc, "a", 8001);
        svc.limiter().set_limit("a", 0);

        let err = svc
            .proxy_request("a", "/v1/chat", "POST", None, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_failover_with_no_endpoints() {
        let svc = service();
        let err = svc
            .proxy_request_with_failover("/v1/chat", "POST", None, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DependencyUnavailable(_)));
    }

    #[test]
    fn test_stats_aggregation() {
        let svc = service();
        register_available(&svc, "a", 8001);
        register_available(&svc, "b", 8002);
        svc.registry().update_health("b", HealthStatus::Unhealthy);

        let stats = svc.stats();
        assert_eq!(stats.total_endpoints, 2);
        assert_eq!(stats.available_endpoints, 1);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.model_stats.len(), 2);
    }
}
