//! Priority-based GPU scheduling and allocation bookkeeping.
//!
//! The scheduler owns the allocation map: one allocation per RUNNING model,
//! recorded at placement time and released when the model leaves RUNNING.
//! Every decision reads a fresh probe snapshot, then deducts its own
//! recorded allocations so bookings survive probes that lag real usage.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::models::{ModelConfig, ResourceRequirement};

use super::calculator;
use super::gpu::{GpuInfo, GpuProbe, ResourceAllocation};

/// Scheduler policy knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When enabled, `reschedule` may propose evicting lower-priority
    /// running models. Off by default.
    pub allow_preemption: bool,
    /// Minimum priority gap before an eviction is proposed.
    pub preemption_priority_gap: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allow_preemption: false,
            preemption_priority_gap: 2,
        }
    }
}

/// Outcome of one placement decision.
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// Placement found and recorded.
    Scheduled(ResourceAllocation),
    /// No placement exists for the current snapshot.
    InsufficientResources(Vec<String>),
}

/// Proposed eviction produced by `reschedule` under the preemption policy.
#[derive(Debug, Clone, Serialize)]
pub struct PreemptionPlan {
    /// Running model to stop.
    pub evict_id: String,
    /// Pending model the freed memory is intended for.
    pub place_id: String,
}

/// Queue key ordering: priority desc, registration time asc, id asc.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKey {
    priority: u8,
    created_at: DateTime<Utc>,
    id: String,
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at)) // earlier first
            .then_with(|| other.id.cmp(&self.id)) // lexicographic first
    }
}

#[derive(Debug, Clone)]
struct RegisteredModel {
    requirement: ResourceRequirement,
    priority: u8,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct SchedulerState {
    registered: HashMap<String, RegisteredModel>,
    allocations: HashMap<String, ResourceAllocation>,
}

/// Priority scheduler over a GPU probe.
pub struct ResourceScheduler {
    probe: Arc<dyn GpuProbe>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl ResourceScheduler {
    pub fn new(probe: Arc<dyn GpuProbe>, config: SchedulerConfig) -> Self {
        Self {
            probe,
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Register a model for scheduling. Re-registration updates the entry.
    pub fn register(&self, config: &ModelConfig) {
        let mut state = self.state.lock();
        state.registered.insert(
            config.id.clone(),
            RegisteredModel {
                requirement: config.resource_requirements.clone(),
                priority: config.priority,
                created_at: config.created_at,
            },
        );
    }

    /// Remove a model, releasing any allocation it still holds.
    pub fn unregister(&self, model_id: &str) {
        let mut state = self.state.lock();
        state.registered.remove(model_id);
        state.allocations.remove(model_id);
    }

    /// Decide placement for one registered model against a fresh snapshot.
    ///
    /// Records the allocation on success. Does not start anything; the
    /// lifecycle manager acts on the outcome. The decision and the record
    /// happen under one lock, so two models cannot book the same memory
    /// against the same snapshot.
    pub async fn schedule(&self, model_id: &str) -> Result<ScheduleOutcome> {
        let raw_snapshot = self.probe.detect().await?;

        let mut state = self.state.lock();
        if state.allocations.contains_key(model_id) {
            return Err(OrchestratorError::Conflict(format!(
                "model {model_id} already holds an allocation"
            )));
        }
        let requirement = state
            .registered
            .get(model_id)
            .map(|m| m.requirement.clone())
            .ok_or_else(|| OrchestratorError::NotFound(model_id.to_string()))?;

        let snapshot = deduct_allocations(raw_snapshot, &state.allocations);
        match calculator::validate(&requirement, &snapshot) {
            Ok(allocation) => {
                state
                    .allocations
                    .insert(model_id.to_string(), allocation.clone());
                tracing::info!(
                    model_id,
                    devices = ?allocation.gpu_devices,
                    memory_mib = allocation.memory_allocated,
                    "allocation recorded"
                );
                Ok(ScheduleOutcome::Scheduled(allocation))
            }
            Err(errors) => Ok(ScheduleOutcome::InsufficientResources(errors)),
        }
    }

    /// Release the allocation held by a model, if any.
    pub fn release(&self, model_id: &str) -> Option<ResourceAllocation> {
        let released = self.state.lock().allocations.remove(model_id);
        if let Some(allocation) = &released {
            tracing::info!(
                model_id,
                memory_mib = allocation.memory_allocated,
                "allocation released"
            );
        }
        released
    }

    /// Current allocation for one model.
    pub fn allocation(&self, model_id: &str) -> Option<ResourceAllocation> {
        self.state.lock().allocations.get(model_id).cloned()
    }

    /// Snapshot of the full allocation map.
    pub fn allocations(&self) -> HashMap<String, ResourceAllocation> {
        self.state.lock().allocations.clone()
    }

    /// Registered models without an allocation, in scheduling order.
    pub fn pending_order(&self) -> Vec<String> {
        let state = self.state.lock();
        self.pending_order_locked(&state)
    }

    /// Re-examine pending models and, under the preemption policy, propose
    /// evictions that would let a higher-priority model place.
    ///
    /// With preemption disabled (the default) this always returns empty.
    pub async fn reschedule(&self) -> Result<Vec<PreemptionPlan>> {
        if !self.config.allow_preemption {
            return Ok(Vec::new());
        }

        let snapshot = self.effective_snapshot().await?;
        let state = self.state.lock();
        let mut plans = Vec::new();

        for pending_id in self.pending_order_locked(&state) {
            let pending = &state.registered[&pending_id];
            if calculator::validate(&pending.requirement, &snapshot).is_ok() {
                continue; // placeable without eviction
            }

            // Lowest-priority running model whose eviction is allowed.
            let candidate = state
                .allocations
                .keys()
                .filter_map(|id| state.registered.get(id).map(|m| (id, m)))
                .filter(|(_, running)| {
                    pending.priority
                        >= running.priority.saturating_add(self.config.preemption_priority_gap)
                })
                .min_by_key(|(_, running)| running.priority);

            if let Some((evict_id, _)) = candidate {
                plans.push(PreemptionPlan {
                    evict_id: evict_id.clone(),
                    place_id: pending_id.clone(),
                });
            }
        }

        Ok(plans)
    }

    fn pending_order_locked(&self, state: &SchedulerState) -> Vec<String> {
        let mut heap = BinaryHeap::new();
        for (id, model) in &state.registered {
            if !state.allocations.contains_key(id) {
                heap.push(QueueKey {
                    priority: model.priority,
                    created_at: model.created_at,
                    id: id.clone(),
                });
            }
        }
        let mut order = Vec::with_capacity(heap.len());
        while let Some(key) = heap.pop() {
            order.push(key.id);
        }
        order
    }

    /// Fresh probe snapshot with recorded allocations already deducted.
    pub async fn effective_snapshot(&self) -> Result<Vec<GpuInfo>> {
        let snapshot = self.probe.detect().await?;
        let state = self.state.lock();
        Ok(deduct_allocations(snapshot, &state.allocations))
    }
}

/// Charge every recorded allocation against a raw probe snapshot.
fn deduct_allocations(
    mut snapshot: Vec<GpuInfo>,
    allocations: &HashMap<String, ResourceAllocation>,
) -> Vec<GpuInfo> {
    for allocation in allocations.values() {
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
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Framework, HealthCheckConfig, RetryPolicy};
    use crate::resources::gpu::{gpu_fixture, StaticGpuProbe};
    use std::collections::BTreeMap;

    fn config(id: &str, priority: u8, gpu_memory: u64) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            name: id.to_string(),
            framework: Framework::NativeServer,
            model_path: "/models/test.gguf".to_string(),
            priority,
            gpu_devices: vec![],
            parameters: BTreeMap::new(),
            additional_parameters: None,
            resource_requirements: ResourceRequirement {
                gpu_memory,
                gpu_devices: vec![],
                cpu_cores: None,
                system_memory: None,
            },
            health_check: HealthCheckConfig::default(),
            retry_policy: RetryPolicy::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn scheduler(free_mib: u64, cfg: SchedulerConfig) -> ResourceScheduler {
        let probe = Arc::new(StaticGpuProbe::new(vec![gpu_fixture(0, free_mib, 0)]));
        ResourceScheduler::new(probe, cfg)
    }

    #[tokio::test]
    async fn test_schedule_records_allocation() {
        let sched = scheduler(16384, SchedulerConfig::default());
        sched.register(&config("m1", 5, 4096));

        match sched.schedule("m1").await.unwrap() {
            ScheduleOutcome::Scheduled(alloc) => {
                assert_eq!(alloc.memory_allocated, 4096);
                assert_eq!(alloc.gpu_devices, vec![0]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(sched.allocation("m1").is_some());
    }

    #[tokio::test]
    async fn test_schedule_insufficient() {
        let sched = scheduler(2048, SchedulerConfig::default());
        sched.register(&config("m1", 5, 4096));

        match sched.schedule("m1").await.unwrap() {
            ScheduleOutcome::InsufficientResources(errors) => assert!(!errors.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(sched.allocation("m1").is_none());
    }

    #[tokio::test]
    async fn test_allocations_reduce_effective_snapshot() {
        let sched = scheduler(16000, SchedulerConfig::default());
        sched.register(&config("lo", 3, 6000));
        sched.register(&config("hi", 9, 10001));

        assert!(matches!(
            sched.schedule("lo").await.unwrap(),
            ScheduleOutcome::Scheduled(_)
        ));
        // 6000 booked; 10001 no longer fits in the remaining 10000.
        assert!(matches!(
            sched.schedule("hi").await.unwrap(),
            ScheduleOutcome::InsufficientResources(_)
        ));

        sched.release("lo");
        assert!(matches!(
            sched.schedule("hi").await.unwrap(),
            ScheduleOutcome::Scheduled(_)
        ));
    }

    #[tokio::test]
    async fn test_schedule_unregistered_is_not_found() {
        let sched = scheduler(16384, SchedulerConfig::default());
        assert!(matches!(
            sched.schedule("ghost").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_double_schedule_is_conflict() {
        let sched = scheduler(16384, SchedulerConfig::default());
        sched.register(&config("m1", 5, 4096));
        sched.schedule("m1").await.unwrap();
        assert!(matches!(
            sched.schedule("m1").await,
            Err(OrchestratorError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_order_priority_then_age_then_id() {
        let sched = scheduler(16384, SchedulerConfig::default());
        let early = Utc::now() - chrono::Duration::seconds(60);

        let mut a = config("alpha", 5, 1024);
        a.created_at = early;
        let mut b = config("beta", 5, 1024);
        b.created_at = Utc::now();
        let mut c = config("gamma", 9, 1024);
        c.created_at = Utc::now();
        // Same priority and timestamp as alpha: id breaks the tie.
        let mut d = config("aardvark", 5, 1024);
        d.created_at = early;

        for cfg in [&a, &b, &c, &d] {
            sched.register(cfg);
        }

        assert_eq!(
            sched.pending_order(),
            vec!["gamma", "aardvark", "alpha", "beta"]
        );
    }

    #[tokio::test]
    async fn test_no_preemption_by_default() {
        let sched = scheduler(16000, SchedulerConfig::default());
        sched.register(&config("lo", 3, 6000));
        sched.register(&config("hi", 9, 12000));
        sched.schedule("lo").await.unwrap();

        let plans = sched.reschedule().await.unwrap();
        assert!(plans.is_empty());
    }

    #[tokio::test]
    async fn test_preemption_when_enabled_and_gap_met() {
        let cfg = SchedulerConfig {
            allow_preemption: true,
            preemption_priority_gap: 2,
        };
        let sched = scheduler(16000, cfg);
        sched.register(&config("lo", 3, 6000));
        sched.register(&config("hi", 9, 12000));
        sched.schedule("lo").await.unwrap();

        let plans = sched.reschedule().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].evict_id, "lo");
        assert_eq!(plans[0].place_id, "hi");
    }

    #[tokio::test]
    async fn test_no_preemption_when_gap_too_small() {
        let cfg = SchedulerConfig {
            allow_preemption: true,
            preemption_priority_gap: 2,
        };
        let sched = scheduler(16000, cfg);
        sched.register(&config("lo", 8, 6000));
        sched.register(&config("hi", 9, 12000));
        sched.schedule("lo").await.unwrap();

        let plans = sched.reschedule().await.unwrap();
        assert!(plans.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_releases_allocation() {
        let sched = scheduler(16384, SchedulerConfig::default());
        sched.register(&config("m1", 5, 4096));
        sched.schedule("m1").await.unwrap();
        sched.unregister("m1");
        assert!(sched.allocation("m1").is_none());

        let snapshot = sched.effective_snapshot().await.unwrap();
        assert_eq!(snapshot[0].memory_free, 16384);
    }
}
