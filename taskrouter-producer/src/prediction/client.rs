//! # Prediction Client
//!
//! Synchronous request/response client for the prediction service with a
//! cached health gate, a hard per-call timeout, and batch support. The
//! client is safe for concurrent use from many publisher invocations and
//! never raises: callers receive a [`PredictionOutcome`] and fall back to
//! manual-priority routing on `Unavailable`.
//!
//! Before sending, missing feature fields are filled deterministically:
//! clock-derived temporal flags, the task type's baseline input size, and
//! the `"anonymous"` placeholder user id. System-state fields are taken
//! only from caller-observed readings and left absent otherwise.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{Datelike, Timelike, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use taskrouter_shared::config::PredictionConfig;
use taskrouter_shared::errors::{TaskRouterError, TaskRouterResult};
use taskrouter_shared::metrics::PredictionMetrics;
use taskrouter_shared::models::features::TaskFeatures;
use taskrouter_shared::models::task::Task;

use super::types::{
    HealthResponse, PredictBatchRequest, PredictBatchResponse, PredictRequest, PredictResponse,
    PredictionKind, PredictionOutcome, StatisticsResponse,
};

/// Hard cap on batch request size; larger inputs are split.
const BATCH_LIMIT: usize = 100;

/// Real system readings supplied by the caller, when it has them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemObservations {
    pub queue_depth: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub active_consumer_count: Option<u32>,
    pub system_load: Option<f64>,
}

/// HTTP client for the prediction service.
pub struct PredictionClient {
    http: reqwest::Client,
    config: PredictionConfig,
    metrics: PredictionMetrics,
    last_healthy: RwLock<Option<Instant>>,
}

impl PredictionClient {
    pub fn new(config: PredictionConfig, metrics: PredictionMetrics) -> TaskRouterResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                TaskRouterError::Prediction(format!("HTTP client construction failed: {e}"))
            })?;
        Ok(Self {
            http,
            config,
            metrics,
            last_healthy: RwLock::new(None),
        })
    }

    /// Predict for one task. Never raises; failures collapse into
    /// [`PredictionOutcome::Unavailable`].
    #[tracing::instrument(
        name = "ai_get_predictions",
        skip_all,
        fields(task_id = %task.id, task_type = %task.task_type)
    )]
    pub async fn predict(
        &self,
        task: &Task,
        kinds: &[PredictionKind],
        observed: Option<&SystemObservations>,
    ) -> PredictionOutcome {
        if !self.health_gate().await {
            self.record_call("service", kind_label(kinds), "unhealthy", None);
            return PredictionOutcome::unavailable("prediction service health check negative");
        }

        let features = prepare_features(task, observed);
        let request = PredictRequest::for_task(task, features, kinds);
        let started = Instant::now();

        let (outcome, backend, status) = self.post_predict(&request).await;
        self.record_call(&backend, kind_label(kinds), status, Some(started.elapsed()));

        if outcome.is_ready() {
            *self.last_healthy.write().await = Some(Instant::now());
        }
        outcome
    }

    async fn post_predict(&self, request: &PredictRequest) -> (PredictionOutcome, String, &'static str) {
        let url = format!("{}/predict", self.config.base_url);
        let response = match self.http.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(timeout_ms = self.config.timeout_ms, "Prediction call timed out");
                return (
                    PredictionOutcome::unavailable(format!(
                        "prediction timed out after {}ms",
                        self.config.timeout_ms
                    )),
                    "service".into(),
                    "timeout",
                );
            }
            Err(e) => {
                warn!(error = %e, "Prediction transport error");
                return (
                    PredictionOutcome::unavailable(format!("prediction transport error: {e}")),
                    "service".into(),
                    "transport_error",
                );
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            return (
                PredictionOutcome::unavailable(format!("prediction service returned {status}")),
                "service".into(),
                "http_error",
            );
        }

        let body: PredictResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return (
                    PredictionOutcome::unavailable(format!("unparseable prediction body: {e}")),
                    "service".into(),
                    "decode_error",
                );
            }
        };

        let backend = if body.backend.is_empty() {
            "unknown".to_string()
        } else {
            body.backend.clone()
        };

        match (body.success, body.predictions) {
            (true, Some(predictions)) => {
                debug!(
                    model_version = %predictions.model_version,
                    backend = %backend,
                    "Predictions received"
                );
                (PredictionOutcome::Ready(predictions), backend, "success")
            }
            _ => {
                let reason = body
                    .error
                    .unwrap_or_else(|| "prediction service reported failure".to_string());
                (PredictionOutcome::unavailable(reason), backend, "rejected")
            }
        }
    }

    /// Batch predict. Inputs larger than the batch limit are split; every
    /// input id appears in the result map.
    pub async fn predict_batch(
        &self,
        tasks: &[Task],
        observed: Option<&SystemObservations>,
    ) -> HashMap<String, PredictionOutcome> {
        let mut results = HashMap::with_capacity(tasks.len());

        if !self.config.batch_enabled {
            for task in tasks {
                let outcome = self.predict(task, &PredictionKind::ALL, observed).await;
                results.insert(task.id.clone(), outcome);
            }
            return results;
        }

        let chunk_size = self.config.batch_size.clamp(1, BATCH_LIMIT);
        for chunk in tasks.chunks(chunk_size) {
            self.predict_chunk(chunk, observed, &mut results).await;
        }
        results
    }

    async fn predict_chunk(
        &self,
        chunk: &[Task],
        observed: Option<&SystemObservations>,
        results: &mut HashMap<String, PredictionOutcome>,
    ) {
        let request = PredictBatchRequest {
            tasks: chunk
                .iter()
                .map(|task| {
                    PredictRequest::for_task(
                        task,
                        prepare_features(task, observed),
                        &PredictionKind::ALL,
                    )
                })
                .collect(),
        };

        let url = format!("{}/predict-batch", self.config.base_url);
        let started = Instant::now();
        let response = self.http.post(&url).json(&request).send().await;

        let body: PredictBatchResponse = match response {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    self.record_call("service", "batch", "decode_error", Some(started.elapsed()));
                    mark_unavailable(chunk, results, format!("unparseable batch body: {e}"));
                    return;
                }
            },
            Ok(response) => {
                self.record_call("service", "batch", "http_error", Some(started.elapsed()));
                mark_unavailable(
                    chunk,
                    results,
                    format!("batch predict returned {}", response.status()),
                );
                return;
            }
            Err(e) => {
                let status = if e.is_timeout() { "timeout" } else { "transport_error" };
                self.record_call("service", "batch", status, Some(started.elapsed()));
                mark_unavailable(chunk, results, format!("batch transport error: {e}"));
                return;
            }
        };

        let backend = if body.backend.is_empty() {
            "unknown".to_string()
        } else {
            body.backend
        };
        self.record_call(&backend, "batch", "success", Some(started.elapsed()));
        *self.last_healthy.write().await = Some(Instant::now());

        let mut by_id: HashMap<String, _> = body
            .results
            .into_iter()
            .map(|item| (item.task_id.clone(), item))
            .collect();

        for task in chunk {
            let outcome = match by_id.remove(&task.id) {
                Some(item) if item.success => match item.predictions {
                    Some(predictions) => PredictionOutcome::Ready(predictions),
                    None => PredictionOutcome::unavailable("batch item had no predictions"),
                },
                Some(item) => PredictionOutcome::unavailable(
                    item.error
                        .unwrap_or_else(|| "batch item reported failure".to_string()),
                ),
                None => PredictionOutcome::unavailable("task id missing from batch response"),
            };
            results.insert(task.id.clone(), outcome);
        }
    }

    /// Liveness probe. Updates the `ai_model_ready` gauges and refreshes
    /// the health cache on success.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);
        let healthy = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                if let Ok(body) = response.json::<HealthResponse>().await {
                    self.metrics
                        .model_ready
                        .with_label_values(&["model"])
                        .set(i64::from(body.model_ready));
                    self.metrics
                        .model_ready
                        .with_label_values(&["fallback"])
                        .set(i64::from(body.fallback_ready));
                }
                true
            }
            Ok(response) => {
                debug!(status = %response.status(), "Prediction health check negative");
                false
            }
            Err(e) => {
                debug!(error = %e, "Prediction health check unreachable");
                false
            }
        };

        if healthy {
            *self.last_healthy.write().await = Some(Instant::now());
        } else {
            self.metrics.model_ready.with_label_values(&["model"]).set(0);
            self.metrics
                .model_ready
                .with_label_values(&["fallback"])
                .set(0);
        }
        healthy
    }

    /// Service-side statistics, for the observability surface.
    pub async fn statistics(&self) -> TaskRouterResult<StatisticsResponse> {
        let url = format!("{}/statistics", self.config.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TaskRouterError::Prediction(format!("statistics call failed: {e}")))?;
        if !response.status().is_success() {
            return Err(TaskRouterError::Prediction(format!(
                "statistics returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| TaskRouterError::Prediction(format!("unparseable statistics body: {e}")))
    }

    /// Cheap gate: skip the health call while the last successful contact
    /// is fresher than the configured window.
    async fn health_gate(&self) -> bool {
        let window = self.config.health_cache_window();
        if let Some(last) = *self.last_healthy.read().await {
            if last.elapsed() < window {
                return true;
            }
        }
        self.health().await
    }

    fn record_call(
        &self,
        backend: &str,
        kind: &str,
        status: &str,
        latency: Option<std::time::Duration>,
    ) {
        self.metrics
            .predictions_total
            .with_label_values(&[backend, kind, status])
            .inc();
        if let Some(latency) = latency {
            self.metrics
                .prediction_latency_seconds
                .with_label_values(&[backend])
                .observe(latency.as_secs_f64());
        }
    }
}

fn kind_label(kinds: &[PredictionKind]) -> &'static str {
    if kinds.len() == PredictionKind::ALL.len() {
        "all"
    } else {
        match kinds {
            [PredictionKind::Duration] => "duration",
            [PredictionKind::Priority] => "priority",
            [PredictionKind::Destination] => "destination",
            [PredictionKind::Anomaly] => "anomaly",
            [PredictionKind::Success] => "success",
            [PredictionKind::Resource] => "resource",
            _ => "partial",
        }
    }
}

fn mark_unavailable(
    chunk: &[Task],
    results: &mut HashMap<String, PredictionOutcome>,
    reason: String,
) {
    for task in chunk {
        results.insert(task.id.clone(), PredictionOutcome::unavailable(reason.clone()));
    }
}

/// Fill missing feature fields deterministically before sending.
pub fn prepare_features(task: &Task, observed: Option<&SystemObservations>) -> TaskFeatures {
    let mut features = task.features.clone().unwrap_or_default();
    let now = Utc::now();

    let hour = now.hour() as u8;
    let weekday = now.weekday();
    let is_weekend = matches!(weekday, chrono::Weekday::Sat | chrono::Weekday::Sun);

    features.temporal.hour_of_day.get_or_insert(hour);
    features
        .temporal
        .day_of_week
        .get_or_insert(weekday.num_days_from_monday() as u8);
    features.temporal.is_weekend.get_or_insert(is_weekend);
    features
        .temporal
        .is_peak_hour
        .get_or_insert(!is_weekend && (9..=17).contains(&hour));

    features
        .input
        .size_bytes
        .get_or_insert_with(|| task.task_type.baseline_input_bytes());

    if features.user.user_id.is_none() {
        let from_parameters = task
            .parameters
            .get("user_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        features.user.user_id = Some(from_parameters.unwrap_or_else(|| "anonymous".to_string()));
    }

    // System state comes only from real readings; absent fields stay absent.
    if let Some(observed) = observed {
        if features.system.queue_depth.is_none() {
            features.system.queue_depth = observed.queue_depth;
        }
        if features.system.cpu_percent.is_none() {
            features.system.cpu_percent = observed.cpu_percent;
        }
        if features.system.memory_percent.is_none() {
            features.system.memory_percent = observed.memory_percent;
        }
        if features.system.active_consumer_count.is_none() {
            features.system.active_consumer_count = observed.active_consumer_count;
        }
        if features.system.system_load.is_none() {
            features.system.system_load = observed.system_load;
        }
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrouter_shared::models::task::TaskType;

    #[test]
    fn prepare_features_imputes_temporal_and_identity() {
        let task = Task::new(TaskType::EmailNotification, "mail", 4);
        let features = prepare_features(&task, None);

        assert!(features.temporal.hour_of_day.is_some());
        assert!(features.temporal.day_of_week.is_some());
        assert!(features.temporal.is_weekend.is_some());
        assert!(features.temporal.is_peak_hour.is_some());
        assert_eq!(features.user.user_id.as_deref(), Some("anonymous"));
        assert_eq!(
            features.input.size_bytes,
            Some(TaskType::EmailNotification.baseline_input_bytes())
        );
        // Never synthesized.
        assert!(features.system.system_load.is_none());
        assert!(features.system.queue_depth.is_none());
        // Not clock-derivable, so not imputed.
        assert!(features.temporal.is_holiday.is_none());
    }

    #[test]
    fn prepare_features_keeps_existing_values() {
        let mut task = Task::new(TaskType::DataExport, "dump", 2);
        let mut features = TaskFeatures::default();
        features.input.size_bytes = Some(999);
        features.temporal.hour_of_day = Some(23);
        features.user.user_id = Some("u-77".into());
        task.features = Some(features);

        let prepared = prepare_features(&task, None);
        assert_eq!(prepared.input.size_bytes, Some(999));
        assert_eq!(prepared.temporal.hour_of_day, Some(23));
        assert_eq!(prepared.user.user_id.as_deref(), Some("u-77"));
    }

    #[test]
    fn prepare_features_reads_user_id_from_parameters() {
        let task = Task::new(TaskType::WebScraping, "crawl", 3)
            .with_parameter("user_id", serde_json::json!("param-user"));
        let features = prepare_features(&task, None);
        assert_eq!(features.user.user_id.as_deref(), Some("param-user"));
    }

    #[test]
    fn observed_system_state_is_used_verbatim() {
        let task = Task::new(TaskType::DataProcessing, "crunch", 5);
        let observed = SystemObservations {
            queue_depth: Some(128),
            system_load: Some(0.42),
            ..Default::default()
        };
        let features = prepare_features(&task, Some(&observed));
        assert_eq!(features.system.queue_depth, Some(128));
        assert_eq!(features.system.system_load, Some(0.42));
        assert!(features.system.cpu_percent.is_none());
    }

    #[test]
    fn kind_label_collapses_requested_sets() {
        assert_eq!(kind_label(&PredictionKind::ALL), "all");
        assert_eq!(kind_label(&[PredictionKind::Priority]), "priority");
        assert_eq!(
            kind_label(&[PredictionKind::Priority, PredictionKind::Duration]),
            "partial"
        );
    }
}
