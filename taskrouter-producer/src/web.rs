//! # Producer Web Surface
//!
//! Thin HTTP surface: task submission, auto-task control, health, and the
//! Prometheus text endpoint. Submission failures come back as a structured
//! error with a short code; internal retries and DLQ movement are
//! invisible to submitters.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskrouter_shared::messaging::RabbitBroker;
use taskrouter_shared::metrics;
use taskrouter_shared::models::features::TaskFeatures;
use taskrouter_shared::models::task::{Task, TaskType};

use crate::auto_task::AutoTaskSupervisor;
use crate::publisher::TaskPublisher;

/// Shared state behind the producer router.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<RabbitBroker>,
    pub publisher: Arc<TaskPublisher>,
    pub supervisor: Arc<AutoTaskSupervisor>,
    pub registry: Arc<Registry>,
}

/// Build the producer API router.
pub fn create_producer_api(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/tasks", post(submit_task))
        .route("/auto-task/start", post(auto_task_start))
        .route("/auto-task/stop", post(auto_task_stop))
        .route("/auto-task/status", get(auto_task_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: TaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manual_priority: u8,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub features: Option<TaskFeatures>,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub destination: String,
    pub routing_key: String,
    pub effective_priority: u8,
    pub routing_reason: String,
}

async fn submit_task(
    State(state): State<ApiState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, (StatusCode, Json<Value>)> {
    let mut task = Task::new(request.task_type, request.title, request.manual_priority)
        .with_description(request.description);
    task.parameters = request.parameters;
    task.features = request.features;

    match state.publisher.publish(&mut task).await {
        Ok(decision) => Ok(Json(SubmitTaskResponse {
            effective_priority: task.effective_priority(),
            task_id: task.id,
            destination: decision.destination.to_string(),
            routing_key: decision.routing_key,
            routing_reason: decision.reason,
        })),
        Err(e) if e.is_overflow() => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "code": "queue_overflow",
                "message": e.to_string(),
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "code": "publish_failed",
                "message": e.to_string(),
            })),
        )),
    }
}

async fn health(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let connected = state.broker.is_connected();
    let status = if connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({
            "status": if connected { "healthy" } else { "degraded" },
            "broker_connected": connected,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn render_metrics(State(state): State<ApiState>) -> Result<String, StatusCode> {
    metrics::render(&state.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn auto_task_start(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    match state.supervisor.start().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"running": true})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"code": "auto_task_start_failed", "message": e.to_string()})),
        ),
    }
}

async fn auto_task_stop(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    match state.supervisor.stop().await {
        Ok(sent) => (
            StatusCode::OK,
            Json(serde_json::json!({"running": false, "tasks_generated": sent})),
        ),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"code": "auto_task_not_running", "message": e.to_string()})),
        ),
    }
}

async fn auto_task_status(State(state): State<ApiState>) -> Json<Value> {
    let counters = state.supervisor.counters();
    Json(serde_json::json!({
        "running": state.supervisor.is_running(),
        "generated": counters.generated.load(Ordering::Relaxed),
        "publish_failures": counters.publish_failures.load(Ordering::Relaxed),
    }))
}
