//! Thin axum transport over the control-API handlers.
//!
//! Owns nothing: every route delegates to `api::handlers` and maps
//! `OrchestratorError` onto the `{detail}` envelope with the standard
//! status codes.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::error::OrchestratorError;
use crate::models::ModelConfig;
use crate::Orchestrator;

use super::handlers;

/// Build the full control-API router.
pub fn router(orch: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/system/overview", get(system_overview))
        .route("/system/gpu", get(system_gpu))
        .route("/models/", get(list_models).post(create_model))
        .route(
            "/models/:id",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/models/:id/start", post(start_model))
        .route("/models/:id/stop", post(stop_model))
        .route("/models/:id/restart", post(restart_model))
        .route("/models/:id/status", get(model_status))
        .route("/models/validate", post(validate_model))
        .route("/monitoring/gpu", get(monitoring_gpu))
        .route("/monitoring/metrics/system", get(monitoring_system))
        .layer(middleware::from_fn_with_state(orch.clone(), drain_guard))
        .with_state(orch)
}

/// Reject new work once shutdown has begun; in-flight requests are
/// tracked so the coordinator can drain them.
async fn drain_guard(
    State(orch): State<Arc<Orchestrator>>,
    request: Request,
    next: Next,
) -> Response {
    match orch.shutdown.track() {
        Some(_guard) => {
            orch.metrics.increment("api_requests_total", 1);
            next.run(request).await
        }
        None => error_response(&OrchestratorError::DependencyUnavailable(
            "service is shutting down".to_string(),
        )),
    }
}

fn error_response(error: &OrchestratorError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "detail": error.to_string() }))).into_response()
}

/// Destructive operations keep the `{success, message}` shape even on
/// failure, alongside the error status and `detail`.
fn operation_response(
    result: crate::error::Result<handlers::OperationResult>,
) -> Response {
    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(error) => {
            let status = StatusCode::from_u16(error.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = json!({
                "success": false,
                "message": error.to_string(),
                "detail": error.to_string(),
            });
            (status, Json(body)).into_response()
        }
    }
}

async fn liveness() -> Response {
    Json(handlers::health()).into_response()
}

async fn system_overview(State(orch): State<Arc<Orchestrator>>) -> Response {
    match handlers::system_overview(&orch).await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn system_gpu(State(orch): State<Arc<Orchestrator>>) -> Response {
    match handlers::system_gpu(&orch).await {
        Ok(gpus) => Json(gpus).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_models(State(orch): State<Arc<Orchestrator>>) -> Response {
    Json(handlers::list_models(&orch).await).into_response()
}

async fn create_model(
    State(orch): State<Arc<Orchestrator>>,
    Json(config): Json<ModelConfig>,
) -> Response {
    match handlers::create_model(&orch, config).await {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_model(State(orch): State<Arc<Orchestrator>>, Path(id): Path<String>) -> Response {
    match handlers::get_model(&orch, &id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn update_model(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Json(config): Json<ModelConfig>,
) -> Response {
    match handlers::update_model(&orch, &id, config).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_model(State(orch): State<Arc<Orchestrator>>, Path(id): Path<String>) -> Response {
    operation_response(handlers::delete_model(&orch, &id).await)
}

async fn start_model(State(orch): State<Arc<Orchestrator>>, Path(id): Path<String>) -> Response {
    operation_response(handlers::start_model(&orch, &id).await)
}

async fn stop_model(State(orch): State<Arc<Orchestrator>>, Path(id): Path<String>) -> Response {
    operation_response(handlers::stop_model(&orch, &id).await)
}

async fn restart_model(State(orch): State<Arc<Orchestrator>>, Path(id): Path<String>) -> Response {
    operation_response(handlers::restart_model(&orch, &id).await)
}

async fn model_status(State(orch): State<Arc<Orchestrator>>, Path(id): Path<String>) -> Response {
    match handlers::model_status(&orch, &id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn validate_model(
    State(orch): State<Arc<Orchestrator>>,
    Json(config): Json<ModelConfig>,
) -> Response {
    match handlers::validate_model(&orch, config).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn monitoring_gpu(State(orch): State<Arc<Orchestrator>>) -> Response {
    match handlers::monitoring_gpu(&orch).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn monitoring_system(State(orch): State<Arc<Orchestrator>>) -> Response {
    match handlers::monitoring_system(&orch).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}
