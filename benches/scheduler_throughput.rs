//! Scheduler throughput: placement decisions and queue ordering under a
//! populated registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};

use modelserver_core::models::{
    Framework, HealthCheckConfig, ModelConfig, ResourceRequirement, RetryPolicy,
};
use modelserver_core::resources::{
    gpu_fixture, ResourceScheduler, SchedulerConfig, StaticGpuProbe,
};

fn model(id: &str, priority: u8, gpu_memory: u64) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        name: id.to_string(),
        framework: Framework::NativeServer,
        model_path: "/models/bench.gguf".to_string(),
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

fn bench_scheduler(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let probe = Arc::new(StaticGpuProbe::new(vec![
        gpu_fixture(0, 81920, 0),
        gpu_fixture(1, 81920, 0),
        gpu_fixture(2, 81920, 0),
        gpu_fixture(3, 81920, 0),
    ]));
    let scheduler = ResourceScheduler::new(probe, SchedulerConfig::default());

    for i in 0..64 {
        scheduler.register(&model(&format!("m{i:02}"), (i % 10) as u8 + 1, 2048));
    }

    c.bench_function("schedule_release_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                scheduler.schedule("m00").await.expect("schedule");
                scheduler.release("m00");
            })
        })
    });

    c.bench_function("pending_order_64_models", |b| {
        b.iter(|| scheduler.pending_order())
    });

    c.bench_function("effective_snapshot_4_gpus", |b| {
        b.iter(|| rt.block_on(scheduler.effective_snapshot()).expect("snapshot"))
    });
}

criterion_group!(benches, bench_scheduler);
criterion_main!(benches);
