//! Declarative model configuration and schema validation.
//!
//! A `ModelConfig` is the desired state of one model server instance.
//! Schema validation here is purely structural; semantic checks (paths,
//! ports, devices) live in the framework adapters and the scheduler.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend family a model runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Framework {
    /// Standalone server binary launched as a child process.
    NativeServer,
    /// Server image launched as a container.
    ContainerServer,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NativeServer => write!(f, "NATIVE_SERVER"),
            Self::ContainerServer => write!(f, "CONTAINER_SERVER"),
        }
    }
}

/// Estimated or declared resource needs of one model.
///
/// The default (zero GPU memory) means "not declared"; the lifecycle
/// manager fills it in from the resource calculator before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// GPU memory in MiB. Must be > 0 once resolved.
    pub gpu_memory: u64,
    /// Requested devices; empty means auto-assign.
    #[serde(default)]
    pub gpu_devices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    /// System memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_memory: Option<u64>,
}

/// Per-model health probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between probes.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Per-probe timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Consecutive failures before the model is considered degraded.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Probe path appended to the instance base URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 30,
            timeout: 10,
            max_failures: 3,
            endpoint: "/health".to_string(),
        }
    }
}

/// Restart policy applied by auto-recovery after health degradation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds before the first restart attempt.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,
    /// Ceiling for the backoff schedule, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
    /// Multiplier between attempts; must be >= 1.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: 5,
            max_delay: 300,
            backoff_factor: 2.0,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    30
}
fn default_timeout() -> u64 {
    10
}
fn default_max_failures() -> u32 {
    3
}
fn default_endpoint() -> String {
    "/health".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    5
}
fn default_max_delay() -> u64 {
    300
}
fn default_backoff_factor() -> f64 {
    2.0
}

/// Declarative desired state for one model server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Stable unique key, `[A-Za-z0-9_-]{1,255}`.
    pub id: String,
    /// Human-readable label; also mined for size/precision hints.
    pub name: String,
    pub framework: Framework,
    /// Filesystem path (native) or image reference (container).
    pub model_path: String,
    /// 1..=10, higher wins scheduling.
    pub priority: u8,
    /// Requested devices; empty means auto-assign.
    #[serde(default)]
    pub gpu_devices: Vec<u32>,
    /// Framework-specific knobs; unknown keys are forwarded to argv.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Free-form argument string, POSIX-quoted tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_parameters: Option<String>,
    /// Declared needs; estimated from the config when omitted.
    #[serde(default)]
    pub resource_requirements: ResourceRequirement,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ModelConfig {
    /// String parameter lookup.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Integer parameter lookup; accepts numeric JSON or numeric strings.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.parameters.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Float parameter lookup.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        match self.parameters.get(key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Listen port, if configured.
    pub fn port(&self) -> Option<u16> {
        self.param_u64("port").and_then(|p| u16::try_from(p).ok())
    }

    /// Bind host for the instance, falling back to the adapter default.
    pub fn host(&self) -> Option<&str> {
        self.param_str("host")
    }

    /// Structural validation of the configuration document.
    ///
    /// Returns every violation rather than stopping at the first; the API
    /// surfaces the full list to the caller.
    pub fn validate_schema(&self) -> ValidationReport {
        let mut report = ValidationReport::valid();

        if !id_pattern().is_match(&self.id) {
            report.error(format!(
                "model id '{}' must match [A-Za-z0-9_-] and be 1-255 characters",
                self.id
            ));
        }
        if self.name.trim().is_empty() {
            report.error("model name must not be empty".to_string());
        }
        if self.model_path.trim().is_empty() {
            report.error("model path must not be empty".to_string());
        }
        if !(1..=10).contains(&self.priority) {
            report.error(format!("priority {} out of range 1-10", self.priority));
        }
        if self.resource_requirements.gpu_memory == 0 {
            report.error("resource requirement gpu_memory must be > 0".to_string());
        }
        if let Some(port) = self.param_u64("port") {
            if !(1024..=65535).contains(&port) {
                report.error(format!("port {port} must be between 1024 and 65535"));
            }
        }
        if self.retry_policy.backoff_factor < 1.0 {
            report.error(format!(
                "retry backoff factor {} must be >= 1.0",
                self.retry_policy.backoff_factor
            ));
        }
        if self.health_check.interval == 0 {
            report.error("health check interval must be > 0".to_string());
        }

        report
    }
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]{1,255}$").expect("static pattern"))
}

/// Outcome of a validation pass: structural or adapter-level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }

    pub fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: ValidationReport) {
        self.is_valid = self.is_valid && other.is_valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}
