//! Priority scheduling through the lifecycle manager: contention on a
//! single device pool, with and without preemption.

mod common;

use modelserver_core::error::OrchestratorError;
use modelserver_core::models::ModelStatus;
use modelserver_core::proxy::ProxyConfig;
use modelserver_core::resources::SchedulerConfig;
use modelserver_core::OrchestratorOptions;

use common::{harness, harness_with, model_config};

#[tokio::test]
async fn test_non_preemptive_default_first_come_first_served() {
    let h = harness(16000).await;
    let manager = &h.orchestrator.manager;

    manager.create(model_config("lo", 3, 6000)).await.unwrap();
    manager.create(model_config("hi", 9, 12000)).await.unwrap();

    manager.start("lo").await.unwrap();
    let err = manager.start("hi").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InsufficientResources(_)));

    // The low-priority model keeps running; nothing was evicted.
    assert_eq!(manager.get_status("lo").await.unwrap(), ModelStatus::Running);
    assert_eq!(manager.get_status("hi").await.unwrap(), ModelStatus::Stopped);
}

#[tokio::test]
async fn test_preemption_evicts_when_gap_sufficient() {
    let options = OrchestratorOptions {
        scheduler: SchedulerConfig {
            allow_preemption: true,
            preemption_priority_gap: 2,
        },
        proxy: ProxyConfig::default(),
    };
    let h = harness_with(16000, options).await;
    let manager = &h.orchestrator.manager;

    manager.create(model_config("lo", 3, 6000)).await.unwrap();
    manager.create(model_config("hi", 9, 12000)).await.unwrap();

    manager.start("lo").await.unwrap();
    manager.start("hi").await.unwrap();

    assert_eq!(manager.get_status("hi").await.unwrap(), ModelStatus::Running);
    assert_eq!(manager.get_status("lo").await.unwrap(), ModelStatus::Stopped);
    assert!(h.orchestrator.scheduler.allocation("hi").is_some());
    assert!(h.orchestrator.scheduler.allocation("lo").is_none());
}

#[tokio::test]
async fn test_preemption_respects_priority_gap() {
    let options = OrchestratorOptions {
        scheduler: SchedulerConfig {
            allow_preemption: true,
            preemption_priority_gap: 2,
        },
        proxy: ProxyConfig::default(),
    };
    let h = harness_with(16000, options).await;
    let manager = &h.orchestrator.manager;

    // Gap of 1: not enough to evict.
    manager.create(model_config("lo", 8, 6000)).await.unwrap();
    manager.create(model_config("hi", 9, 12000)).await.unwrap();

    manager.start("lo").await.unwrap();
    let err = manager.start("hi").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InsufficientResources(_)));
    assert_eq!(manager.get_status("lo").await.unwrap(), ModelStatus::Running);
}

#[tokio::test]
async fn test_freed_capacity_allows_waiting_model() {
    let h = harness(16000).await;
    let manager = &h.orchestrator.manager;

    manager.create(model_config("a", 5, 10000)).await.unwrap();
    manager.create(model_config("b", 5, 10000)).await.unwrap();

    manager.start("a").await.unwrap();
    assert!(manager.start("b").await.is_err());

    manager.stop("a").await.unwrap();
    manager.start("b").await.unwrap();
    assert_eq!(manager.get_status("b").await.unwrap(), ModelStatus::Running);
}
