//! # Consumer Web Surface
//!
//! Health, Prometheus text endpoint, and per-destination processing
//! statistics.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use serde_json::Value;

use taskrouter_shared::messaging::RabbitBroker;
use taskrouter_shared::metrics;
use taskrouter_shared::models::destination::Destination;

use crate::pool::ConsumerPool;

/// Shared state behind the consumer router.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<RabbitBroker>,
    pub pool: Arc<ConsumerPool>,
    pub registry: Arc<Registry>,
}

/// Build the consumer API router.
pub fn create_consumer_api(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/status", get(status))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let connected = state.broker.is_connected();
    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
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

async fn status(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.pool.stats_snapshot();
    let destinations: Value = Destination::ALL
        .iter()
        .map(|destination| {
            let (acked, requeued, dead_lettered) =
                snapshot.get(destination).copied().unwrap_or((0, 0, 0));
            (
                destination.as_str().to_string(),
                serde_json::json!({
                    "queue": destination.queue_name(),
                    "acked": acked,
                    "requeued": requeued,
                    "dead_lettered": dead_lettered,
                }),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(serde_json::json!({
        "destinations": destinations,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
