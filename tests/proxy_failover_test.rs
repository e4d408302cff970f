//! Proxy dispatch against real local upstreams: round-robin ordering,
//! failover on transport errors and 5xx, fast-return on 4xx.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use modelserver_core::models::{HealthStatus, ModelStatus};
use modelserver_core::proxy::{ProxyConfig, ProxyService};

/// Minimal model-server stand-in: /health plus a chat endpoint with a
/// fixed status, counting hits.
async fn spawn_upstream(name: &'static str, status: StatusCode) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route(
            "/v1/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, Json(json!({ "served_by": name })))
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn register(service: &ProxyService, id: &str, addr: SocketAddr) {
    service.registry().register(
        id,
        &format!("http://{addr}"),
        ModelStatus::Running,
        HealthStatus::Healthy,
    );
}

async fn dispatch(service: &ProxyService) -> modelserver_core::proxy::ProxyResponse {
    service
        .proxy_request_with_failover(
            "/v1/chat/completions",
            "POST",
            Some(json!({"messages": []})),
            &HashMap::new(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_round_robin_dispatch_sequence() {
    let (addr_a, _) = spawn_upstream("a", StatusCode::OK).await;
    let (addr_b, _) = spawn_upstream("b", StatusCode::OK).await;

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", addr_a);
    register(&service, "b", addr_b);

    let mut sequence = Vec::new();
    for _ in 0..4 {
        sequence.push(dispatch(&service).await.model_id);
    }
    assert_eq!(sequence, vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_unhealthy_endpoint_excluded() {
    let (addr_a, hits_a) = spawn_upstream("a", StatusCode::OK).await;
    let (addr_b, hits_b) = spawn_upstream("b", StatusCode::OK).await;

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", addr_a);
    register(&service, "b", addr_b);
    service.registry().update_health("b", HealthStatus::Unhealthy);

    for _ in 0..2 {
        assert_eq!(dispatch(&service).await.model_id, "a");
    }
    assert_eq!(hits_a.load(Ordering::SeqCst), 2);
    assert_eq!(hits_b.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failover_on_transport_error() {
    // "a" points at a closed port: connection refused on dispatch.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    let (addr_b, hits_b) = spawn_upstream("b", StatusCode::OK).await;

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", dead_addr);
    register(&service, "b", addr_b);

    let response = dispatch(&service).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.model_id, "b");
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failover_on_upstream_5xx() {
    let (addr_a, hits_a) = spawn_upstream("a", StatusCode::INTERNAL_SERVER_ERROR).await;
    let (addr_b, hits_b) = spawn_upstream("b", StatusCode::OK).await;

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", addr_a);
    register(&service, "b", addr_b);

    let response = dispatch(&service).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.model_id, "b");
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_4xx_returns_immediately_without_failover() {
    let (addr_a, hits_a) = spawn_upstream("a", StatusCode::NOT_FOUND).await;
    let (addr_b, hits_b) = spawn_upstream("b", StatusCode::OK).await;

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", addr_a);
    register(&service, "b", addr_b);

    let response = dispatch(&service).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.model_id, "a");
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_all_endpoints_down_reports_unavailable() {
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", dead_addr);

    let err = service
        .proxy_request_with_failover("/v1/chat/completions", "POST", None, &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        modelserver_core::error::OrchestratorError::DependencyUnavailable(_)
    ));
}

#[tokio::test]
async fn test_pinned_dispatch_and_request_counting() {
    let (addr_a, _) = spawn_upstream("a", StatusCode::OK).await;

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", addr_a);

    let response = service
        .proxy_request(
            "a",
            "/v1/chat/completions",
            "POST",
            Some(json!({"messages": []})),
            &HashMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["served_by"], "a");

    let stats = service.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_connections, 0); // guard released after response
}

#[tokio::test]
async fn test_sweep_marks_dead_endpoint_unhealthy() {
    let (addr_a, _) = spawn_upstream("a", StatusCode::OK).await;
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let service = ProxyService::new(ProxyConfig::default());
    register(&service, "a", addr_a);
    register(&service, "b", dead_addr);

    service.sweep_once().await;

    assert_eq!(
        service.registry().get("a").unwrap().health,
        HealthStatus::Healthy
    );
    assert_eq!(
        service.registry().get("b").unwrap().health,
        HealthStatus::Unhealthy
    );
}
