//! GPU probe contract and device snapshot types.
//!
//! Device enumeration itself is an external collaborator (NVML, sysfs);
//! the orchestrator depends only on the [`GpuProbe`] trait and treats a
//! snapshot as read-only after capture.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};

/// GPU hardware vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Unknown,
}

/// Point-in-time view of one device.
///
/// Memory figures are MiB; `memory_total = memory_used + memory_free` holds
/// at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub device_id: u32,
    pub vendor: GpuVendor,
    pub name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    /// Percent, 0-100.
    pub utilization: f32,
    /// Degrees Celsius.
    pub temperature: f32,
    /// Watts.
    pub power_usage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
}

/// Assignment of devices and memory to one model.
///
/// Owned by the scheduler from allocation until the model leaves RUNNING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub gpu_devices: Vec<u32>,
    /// Total MiB across all assigned devices.
    pub memory_allocated: u64,
    /// MiB charged to each device, aligned with `gpu_devices`.
    pub per_device_memory: Vec<u64>,
    pub allocation_time: DateTime<Utc>,
}

impl ResourceAllocation {
    pub fn new(gpu_devices: Vec<u32>, per_device_memory: Vec<u64>) -> Self {
        let memory_allocated = per_device_memory.iter().sum();
        Self {
            gpu_devices,
            memory_allocated,
            per_device_memory,
            allocation_time: Utc::now(),
        }
    }
}

/// Device enumeration boundary.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Synchronous snapshot of every visible device.
    async fn detect(&self) -> Result<Vec<GpuInfo>>;
}

/// In-memory probe backed by a mutable device table.
///
/// Serves as the injection seam for deployments without a hardware probe
/// and as the test double: tests mutate the table to simulate load.
pub struct StaticGpuProbe {
    devices: RwLock<Vec<GpuInfo>>,
}

impl StaticGpuProbe {
    pub fn new(devices: Vec<GpuInfo>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Probe with no devices; scheduling will report exhaustion.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Replace the device table.
    pub async fn set_devices(&self, devices: Vec<GpuInfo>) {
        *self.devices.write().await = devices;
    }

    /// Adjust one device's used memory, keeping the total invariant.
    pub async fn consume_memory(&self, device_id: u32, mib: u64) {
        let mut devices = self.devices.write().await;
        if let Some(dev) = devices.iter_mut().find(|d| d.device_id == device_id) {
            dev.memory_used = (dev.memory_used + mib).min(dev.memory_total);
            dev.memory_free = dev.memory_total - dev.memory_used;
        }
    }

    /// Release memory on one device, keeping the total invariant.
    pub async fn release_memory(&self, device_id: u32, mib: u64) {
        let mut devices = self.devices.write().await;
        if let Some(dev) = devices.iter_mut().find(|d| d.device_id == device_id) {
            dev.memory_used = dev.memory_used.saturating_sub(mib);
            dev.memory_free = dev.memory_total - dev.memory_used;
        }
    }
}

#[async_trait]
impl GpuProbe for StaticGpuProbe {
    async fn detect(&self) -> Result<Vec<GpuInfo>> {
        Ok(self.devices.read().await.clone())
    }
}

/// Probe backed by the `nvidia-smi` CLI.
///
/// Used by the service binary when no external probe is wired in. AMD or
/// unknown vendors need their own `GpuProbe` implementation.
pub struct NvidiaSmiProbe;

const SMI_QUERY: &str = "--query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu,power.draw,driver_version";

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self
    }

    fn parse_line(line: &str) -> Option<GpuInfo> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 9 {
            return None;
        }
        let memory_total: u64 = fields[2].parse().ok()?;
        let memory_used: u64 = fields[3].parse().ok()?;
        Some(GpuInfo {
            device_id: fields[0].parse().ok()?,
            vendor: GpuVendor::Nvidia,
            name: fields[1].to_string(),
            memory_total,
            memory_used,
            // Recompute so the total invariant holds even if the driver
            // reports reserved memory separately.
            memory_free: memory_total.saturating_sub(memory_used),
            utilization: fields[5].parse().unwrap_or(0.0),
            temperature: fields[6].parse().unwrap_or(0.0),
            power_usage: fields[7].parse().unwrap_or(0.0),
            driver_version: (!fields[8].is_empty() && fields[8] != "[N/A]")
                .then(|| fields[8].to_string()),
        })
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmiProbe {
    async fn detect(&self) -> Result<Vec<GpuInfo>> {
        let output = tokio::process::Command::new("nvidia-smi")
            .arg(SMI_QUERY)
            .arg("--format=csv,noheader,nounits")
            .output()
            .await
            .map_err(probe_unavailable)?;
        if !output.status.success() {
            return Err(probe_unavailable(String::from_utf8_lossy(&output.stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(Self::parse_line)
            .collect())
    }
}

/// Periodic snapshot monitor over any probe.
///
/// Pushes fresh snapshots to a callback until dropped or aborted.
pub struct GpuMonitor {
    handle: JoinHandle<()>,
}

impl GpuMonitor {
    pub fn start<F>(probe: Arc<dyn GpuProbe>, interval: Duration, mut callback: F) -> Self
    where
        F: FnMut(Vec<GpuInfo>) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match probe.detect().await {
                    Ok(snapshot) => callback(snapshot),
                    Err(e) => tracing::warn!(error = %e, "gpu snapshot failed"),
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for GpuMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Convenience constructor used across tests.
pub fn gpu_fixture(device_id: u32, total: u64, used: u64) -> GpuInfo {
    GpuInfo {
        device_id,
        vendor: GpuVendor::Nvidia,
        name: format!("NVIDIA Test Device {device_id}"),
        memory_total: total,
        memory_used: used,
        memory_free: total - used,
        utilization: 0.0,
        temperature: 40.0,
        power_usage: 100.0,
        driver_version: Some("550.00".to_string()),
    }
}

/// Wrap a probe error as a dependency failure.
pub fn probe_unavailable(detail: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::DependencyUnavailable(format!("gpu probe: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_probe_snapshot() {
        let probe = StaticGpuProbe::new(vec![gpu_fixture(0, 24576, 2048)]);
        let snapshot = probe.detect().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].memory_free, 22528);
        assert_eq!(
            snapshot[0].memory_total,
            snapshot[0].memory_used + snapshot[0].memory_free
        );
    }

    #[tokio::test]
    async fn test_consume_and_release_keep_invariant() {
        let probe = StaticGpuProbe::new(vec![gpu_fixture(0, 16384, 0)]);
        probe.consume_memory(0, 4096).await;
        let snap = probe.detect().await.unwrap();
        assert_eq!(snap[0].memory_used, 4096);
        assert_eq!(snap[0].memory_free, 12288);

        probe.release_memory(0, 4096).await;
        let snap = probe.detect().await.unwrap();
        assert_eq!(snap[0].memory_used, 0);
        assert_eq!(snap[0].memory_free, 16384);
    }

    #[test]
    fn test_nvidia_smi_line_parsing() {
        let line = "0, NVIDIA GeForce RTX 4090, 24564, 2048, 22516, 10, 45, 150.25, 550.54.14";
        let info = NvidiaSmiProbe::parse_line(line).unwrap();
        assert_eq!(info.device_id, 0);
        assert_eq!(info.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(info.memory_total, 24564);
        assert_eq!(info.memory_used, 2048);
        assert_eq!(info.memory_free, 22516);
        assert_eq!(info.utilization, 10.0);
        assert_eq!(info.driver_version.as_deref(), Some("550.54.14"));
        assert_eq!(info.memory_total, info.memory_used + info.memory_free);

        assert!(NvidiaSmiProbe::parse_line("garbage").is_none());
    }

    #[test]
    fn test_allocation_totals_shares() {
        let alloc = ResourceAllocation::new(vec![0, 1], vec![6000, 2000]);
        assert_eq!(alloc.memory_allocated, 8000);
        assert_eq!(alloc.gpu_devices, vec![0, 1]);
    }
}
