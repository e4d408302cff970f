// Copyright 2024-2026 ModelServer Contributors
// Licensed under the Apache License, Version 2.0

//! Native-process adapter: launches standalone server binaries.
//!
//! The orchestrator owns the child process; `kill_on_drop` guarantees the
//! instance dies with us on every supported OS. GPU selection is passed
//! through `CUDA_VISIBLE_DEVICES`.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::models::{Framework, ModelConfig, ValidationReport};
use crate::resources::GpuInfo;

use super::{
    device_list, split_arguments, validate_common, wait_ready, AdapterError, AdapterTimeouts,
    FrameworkAdapter, InstanceHandle, StartedInstance, ESTIMATION_KEYS,
};

/// Parameters consumed by the adapter itself rather than forwarded.
const MAPPED_KEYS: &[&str] = &["port", "host", "ctx_size", "n_gpu_layers", "server_binary"];

struct NativeInstance {
    child: Mutex<Child>,
    endpoint: String,
}

/// Adapter for the `NATIVE_SERVER` framework family.
pub struct NativeProcessAdapter {
    timeouts: AdapterTimeouts,
    http: reqwest::Client,
    processes: DashMap<String, Arc<NativeInstance>>,
}

impl NativeProcessAdapter {
    pub fn new(timeouts: AdapterTimeouts) -> Self {
        Self {
            timeouts,
            http: reqwest::Client::new(),
            processes: DashMap::new(),
        }
    }

    /// Compose program + argv from the configuration.
    ///
    /// Order: mapped flags, opaque parameter forwards, then the tokenized
    /// additional parameters, so user-supplied extras override.
    fn build_command(&self, config: &ModelConfig) -> (String, Vec<String>, Option<String>) {
        let program = config
            .param_str("server_binary")
            .unwrap_or("llama-server")
            .to_string();

        let mut args = vec!["-m".to_string(), config.model_path.clone()];
        args.push("--host".to_string());
        args.push(config.host().unwrap_or("127.0.0.1").to_string());
        args.push("--port".to_string());
        args.push(config.port().unwrap_or(8080).to_string());
        if let Some(ctx) = config.param_u64("ctx_size") {
            args.push("--ctx-size".to_string());
            args.push(ctx.to_string());
        }
        if let Some(layers) = config.param_u64("n_gpu_layers") {
            args.push("-ngl".to_string());
            args.push(layers.to_string());
        }

        // Unknown keys pass through as flags, underscores hyphenated.
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
        (program, args, parsed.warning)
    }
}

#[async_trait]
impl FrameworkAdapter for NativeProcessAdapter {
    fn framework(&self) -> Framework {
        Framework::NativeServer
    }

    async fn validate(&self, config: &ModelConfig, gpus: &[GpuInfo]) -> ValidationReport {
        let mut report = ValidationReport::valid();

        let path = Path::new(&config.model_path);
        if !path.exists() {
            report.error(format!("model file does not exist: {}", config.model_path));
        } else if !path.is_file() {
            report.error(format!("model path is not a file: {}", config.model_path));
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
        if !Path::new(&config.model_path).exists() {
            return Err(AdapterError::InvalidConfig(format!(
                "model file does not exist: {}",
                config.model_path
            )));
        }

        let (program, args, warning) = self.build_command(config);
        if let Some(warning) = warning {
            tracing::warn!(model_id = %config.id, warning = %warning, "additional parameter fallback");
        }

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if !config.gpu_devices.is_empty() {
            command.env("CUDA_VISIBLE_DEVICES", device_list(config));
        }

        tracing::info!(model_id = %config.id, program, "launching native instance");
        let mut child = command
            .spawn()
            .map_err(|e| AdapterError::Launch(format!("failed to spawn {program}: {e}")))?;

        let endpoint = self.endpoint(config);
        let ready = tokio::select! {
            r = wait_ready(
                &self.http,
                &endpoint,
                &config.health_check.endpoint,
                self.timeouts.startup,
            ) => r,
            status = child.wait() => {
                let detail = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                return Err(AdapterError::Launch(format!(
                    "instance exited during startup: {detail}"
                )));
            }
        };

        if let Err(err) = ready {
            let _ = child.kill().await;
            return Err(err);
        }

        let pid = child.id().unwrap_or_default();
        self.processes.insert(
            config.id.clone(),
            Arc::new(NativeInstance {
                child: Mutex::new(child),
                endpoint: endpoint.clone(),
            }),
        );

        tracing::info!(model_id = %config.id, pid, endpoint, "native instance ready");
        Ok(StartedInstance {
            endpoint,
            handle: InstanceHandle::Process { pid },
        })
    }

    async fn stop(&self, model_id: &str) -> Result<(), AdapterError> {
        let Some((_, instance)) = self.processes.remove(model_id) else {
            return Ok(()); // unknown id: idempotent success
        };

        let mut child = instance.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(()); // already exited
        }

        let _ = child.start_kill();
        match tokio::time::timeout(self.timeouts.stop, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(AdapterError::Stop(e.to_string())),
            Err(_) => {
                // Reap did not complete within the budget: hard kill.
                child
                    .kill()
                    .await
                    .map_err(|e| AdapterError::Stop(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn probe_process(&self, model_id: &str) -> bool {
        let Some(instance) = self.processes.get(model_id).map(|e| e.value().clone()) else {
            return false;
        };
        let mut child = instance.child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                // Residual state from a crashed instance: reconcile here.
                drop(child);
                self.processes.remove(model_id);
                false
            }
        }
    }

    fn endpoint(&self, config: &ModelConfig) -> String {
        format!(
            "http://{}:{}",
            config.host().unwrap_or("127.0.0.1"),
            config.port().unwrap_or(8080)
        )
    }

    fn default_parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("host".to_string(), Value::from("127.0.0.1")),
            ("port".to_string(), Value::from(8080)),
            ("ctx_size".to_string(), Value::from(2048)),
            ("n_gpu_layers".to_string(), Value::from(0)),
        ])
    }
}
