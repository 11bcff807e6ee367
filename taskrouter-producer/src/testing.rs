//! # Prediction Service Stub
//!
//! In-process implementation of the prediction service contract, used by
//! integration tests so the HTTP path is exercised without an external
//! service. Mirrors the real service's two-tier execution: a "model" tier
//! that is only nominally loaded, and an explainable statistical-plus-rules
//! fallback that actually serves. Every prediction carries the stub's
//! model version.
//!
//! The training buffer is mutex-guarded and bounded; `/training/retrain`
//! succeeds only once the buffer holds at least `minRecords` entries.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;

use taskrouter_shared::models::features::BusinessPriority;
use taskrouter_shared::models::predictions::{ResourceEstimate, TaskPredictions};
use taskrouter_shared::models::task::TaskType;

use crate::prediction::types::{
    HealthResponse, PredictBatchItem, PredictBatchRequest, PredictBatchResponse, PredictRequest,
    PredictResponse, PredictionKind, RetrainResponse, StatisticsResponse, TrainingAck,
    TrainingRecord,
};

/// Maximum records the stub's training buffer retains.
const DEFAULT_BUFFER_CAPACITY: usize = 1_000;
/// Batch requests above this size are rejected with 400.
const BATCH_LIMIT: usize = 100;

struct StubState {
    model_version: String,
    buffer_capacity: usize,
    training_buffer: Mutex<Vec<TrainingRecord>>,
    predictions_served: AtomicU64,
    failing: AtomicBool,
    retrains: AtomicU64,
}

/// Handle to the stub service; clone freely.
#[derive(Clone)]
pub struct PredictionServiceStub {
    state: Arc<StubState>,
}

impl Default for PredictionServiceStub {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionServiceStub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StubState {
                model_version: "stub-fallback-1.0".to_string(),
                buffer_capacity: DEFAULT_BUFFER_CAPACITY,
                training_buffer: Mutex::new(Vec::new()),
                predictions_served: AtomicU64::new(0),
                failing: AtomicBool::new(false),
                retrains: AtomicU64::new(0),
            }),
        }
    }

    /// Flip the stub into outage mode: every endpoint returns 503.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::Release);
    }

    pub async fn training_buffer_len(&self) -> usize {
        self.state.training_buffer.lock().await.len()
    }

    pub async fn last_training_record(&self) -> Option<TrainingRecord> {
        self.state.training_buffer.lock().await.last().cloned()
    }

    pub fn retrain_count(&self) -> u64 {
        self.state.retrains.load(Ordering::Relaxed)
    }

    pub fn predictions_served(&self) -> u64 {
        self.state.predictions_served.load(Ordering::Relaxed)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/predict", post(predict))
            .route("/predict-batch", post(predict_batch))
            .route("/predict-priority", post(predict_priority))
            .route("/predict-duration", post(predict_duration))
            .route("/health", get(health))
            .route("/statistics", get(statistics))
            .route("/training/record", post(training_record))
            .route("/training/retrain", post(training_retrain))
            .with_state(self.state.clone())
    }

    /// Bind on an ephemeral localhost port and serve in the background.
    pub async fn spawn(&self) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub local addr");
        let router = self.router();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        (addr, handle)
    }

    /// Base URL for pointing a `PredictionConfig` at the spawned stub.
    pub fn base_url(addr: SocketAddr) -> String {
        format!("http://{addr}")
    }
}

async fn predict(
    State(state): State<Arc<StubState>>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, StatusCode> {
    if state.failing.load(Ordering::Acquire) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    state.predictions_served.fetch_add(1, Ordering::Relaxed);
    let kinds = effective_kinds(&request.requested_kinds);
    Ok(Json(PredictResponse {
        success: true,
        predictions: Some(fallback_predictions(&request, &kinds, &state.model_version)),
        backend: "fallback".to_string(),
        error: None,
    }))
}

async fn predict_batch(
    State(state): State<Arc<StubState>>,
    Json(request): Json<PredictBatchRequest>,
) -> Result<Json<PredictBatchResponse>, StatusCode> {
    if state.failing.load(Ordering::Acquire) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if request.tasks.len() > BATCH_LIMIT {
        return Err(StatusCode::BAD_REQUEST);
    }
    let results = request
        .tasks
        .iter()
        .map(|item| {
            state.predictions_served.fetch_add(1, Ordering::Relaxed);
            let kinds = effective_kinds(&item.requested_kinds);
            PredictBatchItem {
                task_id: item.task_id.clone(),
                success: true,
                predictions: Some(fallback_predictions(item, &kinds, &state.model_version)),
                error: None,
            }
        })
        .collect();
    Ok(Json(PredictBatchResponse {
        results,
        backend: "fallback".to_string(),
    }))
}

async fn predict_priority(
    State(state): State<Arc<StubState>>,
    Json(mut request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, StatusCode> {
    request.requested_kinds = vec![PredictionKind::Priority];
    predict(State(state), Json(request)).await
}

async fn predict_duration(
    State(state): State<Arc<StubState>>,
    Json(mut request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, StatusCode> {
    request.requested_kinds = vec![PredictionKind::Duration];
    predict(State(state), Json(request)).await
}

async fn health(State(state): State<Arc<StubState>>) -> Result<Json<HealthResponse>, StatusCode> {
    if state.failing.load(Ordering::Acquire) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        model_ready: false,
        fallback_ready: true,
    }))
}

async fn statistics(State(state): State<Arc<StubState>>) -> Json<StatisticsResponse> {
    Json(StatisticsResponse {
        model_version: state.model_version.clone(),
        predictions_today: state.predictions_served.load(Ordering::Relaxed),
        average_processing_time_ms: 1.0,
    })
}

async fn training_record(
    State(state): State<Arc<StubState>>,
    Json(record): Json<TrainingRecord>,
) -> Result<Json<TrainingAck>, StatusCode> {
    if state.failing.load(Ordering::Acquire) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let mut buffer = state.training_buffer.lock().await;
    if buffer.len() >= state.buffer_capacity {
        buffer.remove(0);
    }
    buffer.push(record);
    Ok(Json(TrainingAck {
        recorded: true,
        buffer_size: buffer.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct RetrainQuery {
    #[serde(rename = "minRecords", default)]
    min_records: usize,
}

async fn training_retrain(
    State(state): State<Arc<StubState>>,
    Query(query): Query<RetrainQuery>,
) -> Result<Json<RetrainResponse>, (StatusCode, Json<RetrainResponse>)> {
    let buffer = state.training_buffer.lock().await;
    if buffer.len() >= query.min_records.max(1) {
        state.retrains.fetch_add(1, Ordering::Relaxed);
        Ok(Json(RetrainResponse {
            retrained: true,
            records_used: buffer.len(),
            error: None,
        }))
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            Json(RetrainResponse {
                retrained: false,
                records_used: 0,
                error: Some(format!(
                    "buffer has {} records, {} required",
                    buffer.len(),
                    query.min_records
                )),
            }),
        ))
    }
}

fn effective_kinds(requested: &[PredictionKind]) -> Vec<PredictionKind> {
    if requested.is_empty() {
        PredictionKind::ALL.to_vec()
    } else {
        requested.to_vec()
    }
}

/// Deterministic statistical-plus-rules predictor, the fallback tier.
///
/// Explainable on purpose: the priority reason lists each rule that
/// fired, and equal inputs always produce equal outputs.
fn fallback_predictions(
    request: &PredictRequest,
    kinds: &[PredictionKind],
    model_version: &str,
) -> TaskPredictions {
    let features = &request.features;
    let mut predictions = TaskPredictions {
        task_id: request.task_id.clone(),
        model_version: model_version.to_string(),
        prediction_time_ms: 1.0,
        ..Default::default()
    };

    // Priority rules.
    let mut priority = f64::from(request.manual_priority);
    let mut reasons: Vec<String> = vec![format!("manual priority {}", request.manual_priority)];
    match features.business.business_priority {
        Some(BusinessPriority::Critical) => {
            priority += 3.0;
            reasons.push("business critical".to_string());
            predictions
                .priority_factors
                .insert("business_priority".to_string(), 3.0);
        }
        Some(BusinessPriority::High) => {
            priority += 1.5;
            reasons.push("business high".to_string());
            predictions
                .priority_factors
                .insert("business_priority".to_string(), 1.5);
        }
        Some(BusinessPriority::Low) => {
            priority -= 1.0;
            reasons.push("business low".to_string());
            predictions
                .priority_factors
                .insert("business_priority".to_string(), -1.0);
        }
        _ => {}
    }
    if let Some(tier) = features.user.tier {
        use taskrouter_shared::models::features::UserTier;
        let bump = match tier {
            UserTier::Enterprise => 1.0,
            UserTier::Premium => 0.5,
            UserTier::Free => 0.0,
        };
        if bump > 0.0 {
            priority += bump;
            reasons.push(format!("{tier:?} tier").to_lowercase());
            predictions.priority_factors.insert("tier".to_string(), bump);
        }
    }
    if let Some(deadline) = features.business.deadline {
        if (deadline - Utc::now()).num_minutes() <= 30 {
            priority += 2.0;
            reasons.push("deadline within 30m".to_string());
            predictions
                .priority_factors
                .insert("deadline".to_string(), 2.0);
        }
    }
    let priority = priority.clamp(0.0, 10.0);

    if kinds.contains(&PredictionKind::Priority) {
        predictions.calculated_priority = priority;
        predictions.priority_score = priority / 10.0;
        predictions.priority_reason = reasons.join(", ");
    } else {
        predictions.priority_factors.clear();
    }

    // Duration: per-type base plus a size-proportional term.
    let size_bytes = features
        .input
        .size_bytes
        .unwrap_or_else(|| request.task_type.baseline_input_bytes());
    let base_ms: f64 = match request.task_type {
        TaskType::EmailNotification => 800.0,
        TaskType::SystemMaintenance => 5_000.0,
        TaskType::WebScraping => 10_000.0,
        TaskType::ImageProcessing => 15_000.0,
        TaskType::ReportGeneration => 20_000.0,
        TaskType::DataProcessing => 30_000.0,
        TaskType::DataExport => 45_000.0,
        TaskType::DataBackup => 120_000.0,
    };
    let duration_ms = base_ms + (size_bytes as f64 / 10_240.0);
    if kinds.contains(&PredictionKind::Duration) {
        predictions.predicted_duration_ms = Some(duration_ms);
        predictions.duration_confidence = 0.5;
    }

    // Anomaly rules.
    let quality = features.quality.data_quality_score.unwrap_or(1.0);
    let complexity = features.quality.complexity_score.unwrap_or(0.0);
    let is_anomaly = quality < 0.3 || complexity > 0.9;
    if kinds.contains(&PredictionKind::Anomaly) {
        predictions.is_anomaly = is_anomaly;
        predictions.anomaly_score = if is_anomaly { 0.85 } else { 0.05 };
        if quality < 0.3 {
            predictions.anomaly_tags.push("low_data_quality".to_string());
        }
        if complexity > 0.9 {
            predictions.anomaly_tags.push("high_complexity".to_string());
        }
    }

    // Destination: anomaly wins, then batch suitability, then thresholds.
    if kinds.contains(&PredictionKind::Destination) {
        let scheduled = features.business.is_scheduled;
        let recommended = if is_anomaly {
            "anomaly"
        } else if priority <= 2.0 && duration_ms > 30_000.0 && scheduled != Some(false) {
            "batch"
        } else if priority >= 8.0 {
            "critical"
        } else if priority >= 5.0 {
            "high"
        } else if priority >= 2.0 {
            "normal"
        } else {
            "low"
        };
        predictions.recommended_destination = Some(recommended.to_string());
        predictions.destination_confidence = 0.6;
    }

    if kinds.contains(&PredictionKind::Success) {
        let mut probability: f64 = 0.97;
        if features.dependencies.external_api == Some(true) {
            probability -= 0.05;
            predictions.risk_tags.push("external_api".to_string());
        }
        if is_anomaly {
            probability -= 0.25;
            predictions.risk_tags.push("anomaly".to_string());
        }
        predictions.success_probability = probability.max(0.0);
        predictions.recommended_action = Some(if probability < 0.7 {
            "review before processing".to_string()
        } else {
            "proceed".to_string()
        });
    }

    if kinds.contains(&PredictionKind::Resource) {
        predictions.resources = Some(ResourceEstimate {
            cpu_percent: (base_ms / 1_200.0).min(90.0),
            memory_mb: (size_bytes as f64 / (1024.0 * 1024.0)).max(32.0),
            network_kbps: 64.0,
        });
    }

    predictions
}
