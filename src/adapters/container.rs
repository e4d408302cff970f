//! Container adapter: launches model servers as docker containers.
//!
//! Containers are labeled `orchestrator.model_id=<id>` for reconciliation
//! and removed on stop. GPU reservation uses the runtime's device syntax.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::process::Command;

use crate::models::{Framework, ModelConfig, ValidationReport};
use crate::resources::GpuInfo;

use super::{
    device_list, split_arguments, validate_common, wait_ready, AdapterError, AdapterTimeouts,
    FrameworkAdapter, InstanceHandle, StartedInstance, ESTIMATION_KEYS,
};

const DEFAULT_IMAGE: &str = "vllm/vllm-openai:latest";

/// Parameters consumed by the adapter itself rather than forwarded.
const MAPPED_KEYS: &[&str] = &[
    "port",
    "host",
    "docker_image",
    "tensor_parallel_size",
    "gpu_memory_utilization",
];

struct ContainerInstance {
    container_id: String,
    endpoint: String,
}

/// Adapter for the `CONTAINER_SERVER` framework family.
pub struct ContainerAdapter {
    timeouts: AdapterTimeouts,
    http: reqwest::Client,
    containers: DashMap<String, Arc<ContainerInstance>>,
}

impl ContainerAdapter {
    pub fn new(timeouts: AdapterTimeouts) -> Self {
        Self {
            timeouts,
            http: reqwest::Client::new(),
            containers: DashMap::new(),
        }
    }

    fn container_name(model_id: &str) -> String {
        format!("modelserver-{model_id}")
    }

    fn image(config: &ModelConfig) -> String {
        config
            .param_str("docker_image")
            .unwrap_or(DEFAULT_IMAGE)
            .to_string()
    }

    /// Compose the full `docker run` argument vector.
    fn build_run_args(&self, config: &ModelConfig) -> (Vec<String>, Option<String>) {
        let name = Self::container_name(&config.id);
        let port = config.port().unwrap_or(8000);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name,
            "--label".into(),
            format!("orchestrator.model_id={}", config.id),
            "-p".into(),
            format!("{port}:{port}"),
        ];
        if !config.gpu_devices.is_empty() {
            args.push("--gpus".into());
            args.push(format!("device={}", device_list(config)));
        }
        args.push(Self::image(config));

        // Server command inside the container.
        args.push("--model".into());
        args.push(config.model_path.clone());
        args.push("--host".into());
        args.push(config.host().unwrap_or("0.0.0.0").to_string());
        args.push("--port".into());
        args.push(port.to_string());
        if let Some(tp) = config.param_u64("tensor_parallel_size") {
            args.push("--tensor-parallel-size".into());
            args.push(tp.to_string());
        }
        if let Some(util) = config.param_f64("gpu_memory_utilization") {
            args.push("--gpu-memory-utilization".into());
            args.push(util.to_string());
        }
        for (key, value) in &config.parameters {
            if MAPPED_KEYS.contains(&key.as_str()) || ESTIMATION_KEYS.contains(&key.as_str()) {
                continue;
            }
            let flag = format!("--{}", key.replace('_', "-"));
            match value {
                Value::Bool(true) => args.push(flag),
                Value::Bool(false) | Value::Null => {}
                Value::String(s) => {
                    args.push(flag);
                    args.push(s.clone());
                }
                other => {
                    args.push(flag);
                    args.push(other.to_string());
                }
            }
        }

        let parsed = split_arguments(config.additional_parameters.as_deref());
        args.extend(parsed.tokens);
        (args, parsed.warning)
    }

    async fn docker(args: &[&str]) -> Result<std::process::Output, AdapterError> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| AdapterError::ResourceInit(format!("container runtime unavailable: {e}")))
    }
}

#[async_trait]
impl FrameworkAdapter for ContainerAdapter {
    fn framework(&self) -> Framework {
        Framework::ContainerServer
    }

    async fn validate(&self, config: &ModelConfig, gpus: &[GpuInfo]) -> ValidationReport {
        let mut report = ValidationReport::valid();

        match Self::docker(&["version", "--format", "{{.Server.Version}}"]).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => report.error(format!(
                "container runtime unavailable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Err(e) => report.error(e.to_string()),
        }

        if report.is_valid {
            let image = Self::image(config);
            match Self::docker(&["image", "inspect", &image]).await {
                Ok(output) if output.status.success() => {}
                _ => report.warn(format!("image {image} not present locally; start will pull it")),
            }
        }

        if let Some(port) = config.param_u64("port") {
            if !(1024..=65535).contains(&port) {
                report.error(format!("port {port} must be between 1024 and 65535"));
            }
        }

        validate_common(config, gpus, &mut report);
        report
    }

    async fn start(&self, config: &ModelConfig) -> Result<StartedInstance, AdapterError> {
        let name = Self::container_name(&config.id);
        // Clear any residual container from a previous unclean stop.
        let _ = Self::docker(&["rm", "-f", &name]).await;

        let (args, warning) = self.build_run_args(config);
        if let Some(warning) = warning {
            tracing::warn!(model_id = %config.id, warning = %warning, "additional parameter fallback");
        }

        tracing::info!(model_id = %config.id, image = %Self::image(config), "launching container");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = Self::docker(&arg_refs).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Unable to find image") || stderr.contains("pull access denied") {
                return Err(AdapterError::ResourceInit(format!(
                    "image pull failed: {}",
                    stderr.trim()
                )));
            }
            return Err(AdapterError::Launch(format!(
                "container create failed: {}",
                stderr.trim()
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let endpoint = self.endpoint(config);
        if let Err(err) = wait_ready(
            &self.http,
            &endpoint,
            &config.health_check.endpoint,
            self.timeouts.startup,
        )
        .await
        {
            let _ = Self::docker(&["rm", "-f", &name]).await;
            return Err(err);
        }

        self.containers.insert(
            config.id.clone(),
            Arc::new(ContainerInstance {
                container_id: container_id.clone(),
                endpoint: endpoint.clone(),
            }),
        );

        tracing::info!(model_id = %config.id, container = %name, endpoint, "container ready");
        Ok(StartedInstance {
            endpoint,
            handle: InstanceHandle::Container { container_id },
        })
    }

    async fn stop(&self, model_id: &str) -> Result<(), AdapterError> {
        self.containers.remove(model_id);
        let name = Self::container_name(model_id);
        let grace = self.timeouts.stop.as_secs().to_string();

        // Graceful stop, then unconditional removal (removed-on-stop
        // semantics). Both are no-ops for an unknown container.
        if let Ok(output) = Self::docker(&["stop", "-t", &grace, &name]).await {
            if !output.status.success() {
                tracing::debug!(container = %name, "container stop reported: {}",
                    String::from_utf8_lossy(&output.stderr).trim());
            }
        }
        let _ = Self::docker(&["rm", "-f", &name]).await;
        Ok(())
    }

    async fn probe_process(&self, model_id: &str) -> bool {
        let name = Self::container_name(model_id);
        match Self::docker(&["inspect", "-f", "{{.State.Running}}", &name]).await {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => {
                self.containers.remove(model_id);
                false
            }
        }
    }

    fn endpoint(&self, config: &ModelConfig) -> String {
        let host = match config.host() {
            Some("0.0.0.0") | None => "127.0.0.1",
            Some(host) => host,
        };
        format!("http://{}:{}", host, config.port().unwrap_or(8000))
    }

    fn default_parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("host".to_string(), Value::from("0.0.0.0")),
            ("port".to_string(), Value::from(8000)),
            ("tensor_parallel_size".to_string(), Value::from(1)),
            ("gpu_memory_utilization".to_string(), Value::from(0.9)),
            ("docker_image".to_string(), Value::from(DEFAULT_IMAGE)),
        ])
    }
}
