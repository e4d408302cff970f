//! Health-driven auto-recovery: degradation signals schedule backoff
//! restarts, attempts are bounded, and a healthy probe resets the budget.

mod common;

use std::time::Duration;

use modelserver_core::models::{HealthCheckResult, ModelStatus, RetryPolicy};

use common::{harness, model_config, wait_until, Harness};

async fn start_supervised(h: &Harness, id: &str) {
    let mut config = model_config(id, 5, 1024);
    config.retry_policy = RetryPolicy {
        enabled: true,
        max_attempts: 2,
        initial_delay: 1,
        max_delay: 300,
        backoff_factor: 2.0,
    };
    h.orchestrator.manager.create(config).await.unwrap();
    h.orchestrator.manager.start(id).await.unwrap();

    // Instance registration with the health checker is asynchronous.
    let checker = h.orchestrator.checker.clone();
    let id = id.to_string();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let checker = checker.clone();
            let id = id.clone();
            async move { checker.get_status(&id).await.is_some() }
        })
        .await,
        "model never registered with the health checker"
    );
}

async fn fail_probes(h: &Harness, id: &str, count: usize) {
    for _ in 0..count {
        h.orchestrator
            .checker
            .record(HealthCheckResult::unhealthy(
                id,
                "connection refused".to_string(),
                None,
            ))
            .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_degradation_schedules_bounded_restarts() {
    let h = harness(16384).await;
    start_supervised(&h, "m1").await;
    assert_eq!(h.adapter.starts(), 1);

    // Episode 1: threshold reached, one restart after the initial delay.
    fail_probes(&h, "m1", 2).await;
    assert!(
        wait_until(Duration::from_secs(5), || async { h.adapter.starts() == 2 }).await,
        "first restart never happened"
    );
    assert_eq!(h.orchestrator.recovery.state("m1").unwrap().attempt, 1);
    assert_eq!(
        h.orchestrator.manager.get_status("m1").await.unwrap(),
        ModelStatus::Running
    );

    // Extra failures inside the same episode do not schedule again.
    let starts = h.adapter.starts();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.adapter.starts(), starts);

    // Episode 2: second restart, doubled delay.
    start_wait_for_reregistration(&h, "m1").await;
    fail_probes(&h, "m1", 2).await;
    assert!(
        wait_until(Duration::from_secs(8), || async { h.adapter.starts() == 3 }).await,
        "second restart never happened"
    );
    assert_eq!(h.orchestrator.recovery.state("m1").unwrap().attempt, 2);

    // Episode 3: budget exhausted, no more restarts, model parked in ERROR.
    start_wait_for_reregistration(&h, "m1").await;
    fail_probes(&h, "m1", 2).await;
    assert!(
        wait_until(Duration::from_secs(5), || async {
            h.orchestrator.manager.get_status("m1").await.unwrap() == ModelStatus::Error
        })
        .await,
        "model never marked failed"
    );
    assert_eq!(h.adapter.starts(), 3);
}

/// Wait until the restarted model is re-registered with the checker and
/// the previous recovery task has fully settled.
async fn start_wait_for_reregistration(h: &Harness, id: &str) {
    let checker = h.orchestrator.checker.clone();
    let model_id = id.to_string();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let checker = checker.clone();
            let model_id = model_id.clone();
            async move {
                checker
                    .get_details(&model_id)
                    .await
                    .map(|d| d.failure_count == 0)
                    .unwrap_or(false)
            }
        })
        .await,
        "model never re-registered after restart"
    );
    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.orchestrator
                .recovery
                .state(id)
                .map(|s| !s.in_flight)
                .unwrap_or(true)
        })
        .await,
        "recovery task never settled"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_healthy_probe_resets_retry_budget() {
    let h = harness(16384).await;
    start_supervised(&h, "m1").await;

    fail_probes(&h, "m1", 2).await;
    assert!(wait_until(Duration::from_secs(5), || async { h.adapter.starts() == 2 }).await);
    assert_eq!(h.orchestrator.recovery.state("m1").unwrap().attempt, 1);

    // Model comes back healthy: the attempt counter resets.
    start_wait_for_reregistration(&h, "m1").await;
    h.orchestrator
        .checker
        .record(HealthCheckResult::healthy("m1", 0.05))
        .await;
    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.orchestrator
                .recovery
                .state("m1")
                .map(|s| s.attempt == 0)
                .unwrap_or(false)
        })
        .await,
        "attempt counter never reset"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_retry_policy_never_restarts() {
    let h = harness(16384).await;
    let mut config = model_config("m1", 5, 1024);
    config.retry_policy.enabled = false;
    h.orchestrator.manager.create(config).await.unwrap();
    h.orchestrator.manager.start("m1").await.unwrap();

    let checker = h.orchestrator.checker.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let checker = checker.clone();
            async move { checker.get_status("m1").await.is_some() }
        })
        .await
    );

    fail_probes(&h, "m1", 5).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.adapter.starts(), 1);
    assert_eq!(
        h.orchestrator.manager.get_status("m1").await.unwrap(),
        ModelStatus::Running
    );
}
