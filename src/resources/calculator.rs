// Copyright 2024-2026 ModelServer Contributors
// Licensed under the Apache License, Version 2.0

//! Resource estimation and placement validation.
//!
//! Pure functions: every decision is computed against a caller-supplied
//! device snapshot, never against live state. Estimation failures degrade
//! to a conservative default instead of propagating.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{Framework, ModelConfig, ResourceRequirement};

use super::gpu::{GpuInfo, ResourceAllocation};

/// GPU memory assumed when estimation cannot produce a figure, in MiB.
const CONSERVATIVE_GPU_MEMORY: u64 = 8192;

/// Floor for estimated system memory, in MiB.
const MIN_SYSTEM_MEMORY: u64 = 2048;

/// Numeric precision of model weights, as advertised or inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Fp32,
    Fp16,
    Int8,
    Int4,
}

impl Precision {
    fn bytes_per_param(self) -> f64 {
        match self {
            Self::Fp32 => 4.0,
            Self::Fp16 => 2.0,
            Self::Int8 => 1.0,
            Self::Int4 => 0.5,
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Some(Self::Fp32),
            "fp16" | "f16" | "float16" | "bf16" => Some(Self::Fp16),
            "int8" | "q8" => Some(Self::Int8),
            "int4" | "q4" => Some(Self::Int4),
            _ => None,
        }
    }
}

/// Memory layout summary across a device snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentationReport {
    pub total_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub largest_free_block: u64,
    /// `1 - largest_free_block / free_memory`; 0 when nothing is free.
    pub fragmentation_ratio: f64,
    pub gpu_count: usize,
    pub average_utilization: f64,
}

/// Estimate per-model resource needs from config, name, and file size.
///
/// Never fails: if no size can be inferred the conservative default is
/// returned so scheduling can still proceed.
pub fn estimate(config: &ModelConfig) -> ResourceRequirement {
    match estimate_inner(config) {
        Some(requirement) => requirement,
        None => {
            tracing::warn!(
                model_id = %config.id,
                "resource estimation fell back to conservative default"
            );
            conservative_default(config)
        }
    }
}

fn estimate_inner(config: &ModelConfig) -> Option<ResourceRequirement> {
    let size_gb = extract_model_size(config)?;
    let precision = extract_precision(config);
    let ctx_len = config.param_u64("context_length").unwrap_or(2048);
    let batch = config.param_u64("batch_size").unwrap_or(1).max(1);

    let base = base_model_memory(size_gb, precision, config.framework);
    let ctx = context_memory(size_gb, ctx_len, batch, precision);
    let overhead = framework_overhead(config.framework);
    let gpu_memory = (base + ctx + overhead).ceil() as u64;

    Some(ResourceRequirement {
        gpu_memory,
        gpu_devices: config.gpu_devices.clone(),
        cpu_cores: Some(estimate_cpu_cores(config, batch)),
        system_memory: Some(estimate_system_memory(gpu_memory)),
    })
}

fn conservative_default(config: &ModelConfig) -> ResourceRequirement {
    ResourceRequirement {
        gpu_memory: CONSERVATIVE_GPU_MEMORY,
        gpu_devices: config.gpu_devices.clone(),
        cpu_cores: Some(4),
        system_memory: Some(estimate_system_memory(CONSERVATIVE_GPU_MEMORY)),
    }
}

/// Model size in billions of parameters (≈ GB at fp8 scale).
///
/// Order: explicit parameter, size token in the name (`7b`, `13B`), then
/// on-disk file size with a 1.5x loading factor.
fn extract_model_size(config: &ModelConfig) -> Option<f64> {
    if let Some(size) = config.param_f64("model_size_gb") {
        return Some(size);
    }

    if let Some(captures) = size_pattern().captures(&config.name) {
        if let Ok(size) = captures[1].parse::<f64>() {
            return Some(size);
        }
    }

    let metadata = std::fs::metadata(&config.model_path).ok()?;
    let file_gb = metadata.len() as f64 / (1024.0 * 1024.0 * 1024.0);
    Some(file_gb * 1.5)
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:^|[-_.\s])(\d+(?:\.\d+)?)b(?:$|[-_.\s])").expect("static pattern")
    })
}

fn extract_precision(config: &ModelConfig) -> Precision {
    if let Some(p) = config.param_str("precision").and_then(Precision::parse) {
        return p;
    }
    if let Some(p) = config.param_str("quantization").and_then(Precision::parse) {
        return p;
    }
    for token in config.name.split(['-', '_', '.', ' ']) {
        if let Some(p) = Precision::parse(token) {
            return p;
        }
    }
    Precision::Fp16
}

/// Weight memory in MiB: parameter count scaled by precision width, plus
/// a framework factor (container runtimes preallocate more aggressively).
fn base_model_memory(size_gb: f64, precision: Precision, framework: Framework) -> f64 {
    let weights_mib = size_gb * precision.bytes_per_param() * 1024.0;
    let factor = match framework {
        Framework::NativeServer => 1.05,
        Framework::ContainerServer => 1.25,
    };
    weights_mib * factor
}

/// KV-cache and activation memory in MiB, growing with context and batch.
fn context_memory(size_gb: f64, ctx_len: u64, batch: u64, precision: Precision) -> f64 {
    let layer_scale = size_gb * 0.12 + 1.0;
    (ctx_len as f64 / 1024.0) * batch as f64 * layer_scale * precision.bytes_per_param() * 32.0
}

fn framework_overhead(framework: Framework) -> f64 {
    match framework {
        Framework::NativeServer => 512.0,
        Framework::ContainerServer => 2048.0,
    }
}

fn estimate_cpu_cores(config: &ModelConfig, batch: u64) -> u32 {
    let base = match config.framework {
        Framework::NativeServer => 4u64,
        Framework::ContainerServer => 8u64,
    };
    let wanted = base + batch / 4;
    wanted.min(num_cpus::get() as u64).max(1) as u32
}

fn estimate_system_memory(gpu_memory: u64) -> u64 {
    (gpu_memory / 2).clamp(MIN_SYSTEM_MEMORY, gpu_memory)
}

/// Validate a requirement against a device snapshot.
///
/// On success the returned allocation charges each device no more than its
/// free memory at capture time.
pub fn validate(
    requirement: &ResourceRequirement,
    gpus: &[GpuInfo],
) -> std::result::Result<ResourceAllocation, Vec<String>> {
    if gpus.is_empty() {
        return Err(vec!["no gpu devices available".to_string()]);
    }

    if requirement.gpu_devices.is_empty() {
        validate_auto(requirement, gpus)
    } else {
        validate_pinned(requirement, gpus)
    }
}

/// Pinned placement: every listed device must exist and hold its even share.
fn validate_pinned(
    requirement: &ResourceRequirement,
    gpus: &[GpuInfo],
) -> std::result::Result<ResourceAllocation, Vec<String>> {
    let mut errors = Vec::new();
    let count = requirement.gpu_devices.len() as u64;
    let share = requirement.gpu_memory / count;
    let remainder = requirement.gpu_memory % count;

    let mut shares = Vec::with_capacity(requirement.gpu_devices.len());
    for (i, device_id) in requirement.gpu_devices.iter().enumerate() {
        let share = if i == 0 { share + remainder } else { share };
        match gpus.iter().find(|g| g.device_id == *device_id) {
            None => errors.push(format!("gpu device {device_id} does not exist")),
            Some(gpu) if gpu.memory_free < share => errors.push(format!(
                "gpu device {device_id} has {} MiB free, needs {share} MiB",
                gpu.memory_free
            )),
            Some(_) => shares.push(share),
        }
    }

    if errors.is_empty() {
        Ok(ResourceAllocation::new(
            requirement.gpu_devices.clone(),
            shares,
        ))
    } else {
        Err(errors)
    }
}

/// Auto placement: smallest single device that fits, then greedy multi-GPU.
fn validate_auto(
    requirement: &ResourceRequirement,
    gpus: &[GpuInfo],
) -> std::result::Result<ResourceAllocation, Vec<String>> {
    // Single-GPU first: the smallest fitting device minimizes fragmentation.
    if let Some(gpu) = gpus
        .iter()
        .filter(|g| g.memory_free >= requirement.gpu_memory)
        .min_by_key(|g| g.memory_free)
    {
        return Ok(ResourceAllocation::new(
            vec![gpu.device_id],
            vec![requirement.gpu_memory],
        ));
    }

    // Greedy multi-GPU: largest free first until the requirement is met.
    let mut sorted: Vec<&GpuInfo> = gpus.iter().collect();
    sorted.sort_by(|a, b| b.memory_free.cmp(&a.memory_free));

    let mut devices = Vec::new();
    let mut shares = Vec::new();
    let mut remaining = requirement.gpu_memory;
    for gpu in sorted {
        if remaining == 0 {
            break;
        }
        if gpu.memory_free == 0 {
            continue;
        }
        let take = remaining.min(gpu.memory_free);
        devices.push(gpu.device_id);
        shares.push(take);
        remaining -= take;
    }

    if remaining > 0 {
        let free_total: u64 = gpus.iter().map(|g| g.memory_free).sum();
        return Err(vec![format!(
            "insufficient gpu memory: required {} MiB, {} MiB free across {} devices",
            requirement.gpu_memory,
            free_total,
            gpus.len()
        )]);
    }

    Ok(ResourceAllocation::new(devices, shares))
}

/// Summarize memory layout and utilization across a snapshot.
pub fn fragmentation(gpus: &[GpuInfo]) -> FragmentationReport {
    if gpus.is_empty() {
        return FragmentationReport {
            total_memory: 0,
            used_memory: 0,
            free_memory: 0,
            largest_free_block: 0,
            fragmentation_ratio: 0.0,
            gpu_count: 0,
            average_utilization: 0.0,
        };
    }

    let total_memory: u64 = gpus.iter().map(|g| g.memory_total).sum();
    let used_memory: u64 = gpus.iter().map(|g| g.memory_used).sum();
    let free_memory: u64 = gpus.iter().map(|g| g.memory_free).sum();
    let largest_free_block = gpus.iter().map(|g| g.memory_free).max().unwrap_or(0);
    let fragmentation_ratio = if free_memory > 0 {
        1.0 - largest_free_block as f64 / free_memory as f64
    } else {
        0.0
    };
    let average_utilization =
        gpus.iter().map(|g| g.utilization as f64).sum::<f64>() / gpus.len() as f64;

    FragmentationReport {
        total_memory,
        used_memory,
        free_memory,
        largest_free_block,
        fragmentation_ratio,
        gpu_count: gpus.len(),
        average_utilization,
    }
}

/// Propose placements for a batch of requirements.
///
/// Largest requirements are placed first against a simulated snapshot; the
/// result is reported in original-index order with `None` for requirements
/// that could not be placed.
pub fn optimize(
    requirements: &[ResourceRequirement],
    gpus: &[GpuInfo],
) -> Vec<(usize, Option<ResourceAllocation>)> {
    let mut order: Vec<usize> = (0..requirements.len()).collect();
    order.sort_by(|a, b| requirements[*b].gpu_memory.cmp(&requirements[*a].gpu_memory));

    let mut snapshot: Vec<GpuInfo> = gpus.to_vec();
    let mut results: Vec<(usize, Option<ResourceAllocation>)> = Vec::new();

    for index in order {
        let outcome = validate(&requirements[index], &snapshot).ok();
        if let Some(allocation) = &outcome {
            for (device_id, share) in allocation
                .gpu_devices
                .iter()
                .zip(allocation.per_device_memory.iter())
            {
                if let Some(gpu) = snapshot.iter_mut().find(|g| g.device_id == *device_id) {
                    gpu.memory_free = gpu.memory_free.saturating_sub(*share);
                    gpu.memory_used = gpu.memory_total - gpu.memory_free;
                }
            }
        }
        results.push((index, outcome));
    }

    results.sort_by_key(|(index, _)| *index);
    results
}
