//! GPU resources: probe contract, estimation, and priority scheduling.

pub mod calculator;
mod gpu;
mod scheduler;

pub use calculator::FragmentationReport;
pub use gpu::{
    gpu_fixture, probe_unavailable, GpuInfo, GpuMonitor, GpuProbe, GpuVendor, NvidiaSmiProbe,
    ResourceAllocation, StaticGpuProbe,
};
pub use scheduler::{
    PreemptionPlan, ResourceScheduler, ScheduleOutcome, SchedulerConfig,
};
