//! # Prediction Service Contract
//!
//! Request and response types for the prediction service HTTP API. JSON on
//! both sides; 2xx means success. The service is an external collaborator:
//! these types are the whole contract, and nothing here depends on which
//! estimator sits behind the endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::features::TaskFeatures;
use crate::models::predictions::TaskPredictions;
use crate::models::task::{Task, TaskType};

/// The six selectable prediction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionKind {
    Duration,
    Priority,
    Destination,
    Anomaly,
    Success,
    Resource,
}

impl PredictionKind {
    /// Every kind; the publisher requests all of them.
    pub const ALL: [PredictionKind; 6] = [
        PredictionKind::Duration,
        PredictionKind::Priority,
        PredictionKind::Destination,
        PredictionKind::Anomaly,
        PredictionKind::Success,
        PredictionKind::Resource,
    ];
}

/// Result discriminant of a prediction attempt.
///
/// The client never raises: every failure mode (timeout, non-2xx,
/// unparseable body, negative health) collapses into `Unavailable` with a
/// reason, and callers branch on the discriminant to choose fallback
/// routing.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutcome {
    Ready(TaskPredictions),
    Unavailable(String),
}

impl PredictionOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PredictionOutcome::Ready(_))
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        PredictionOutcome::Unavailable(reason.into())
    }

    /// The predictions, if any.
    pub fn into_option(self) -> Option<TaskPredictions> {
        match self {
            PredictionOutcome::Ready(p) => Some(p),
            PredictionOutcome::Unavailable(_) => None,
        }
    }
}

/// One task's worth of inputs for `/predict` and `/predict-batch` items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub task_id: String,
    pub task_type: TaskType,
    pub manual_priority: u8,
    pub features: TaskFeatures,
    #[serde(default)]
    pub requested_kinds: Vec<PredictionKind>,
}

impl PredictRequest {
    pub fn for_task(task: &Task, features: TaskFeatures, kinds: &[PredictionKind]) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type,
            manual_priority: task.manual_priority,
            features,
            requested_kinds: kinds.to_vec(),
        }
    }
}

/// Response envelope for `/predict`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<TaskPredictions>,
    /// Which execution tier served this: `model` or `fallback`.
    #[serde(default)]
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request body for `/predict-batch`, at most 100 items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictBatchRequest {
    pub tasks: Vec<PredictRequest>,
}

/// One element of the batch response, success-flagged per item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictBatchItem {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<TaskPredictions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictBatchResponse {
    pub results: Vec<PredictBatchItem>,
    #[serde(default)]
    pub backend: String,
}

/// `GET /health` body. 2xx only when at least the fallback tier is ready.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub model_ready: bool,
    #[serde(default)]
    pub fallback_ready: bool,
}

/// `GET /statistics` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub model_version: String,
    pub predictions_today: u64,
    pub average_processing_time_ms: f64,
}

/// One observed outcome, posted to `/training/record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub task_id: String,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<TaskFeatures>,
    pub actual_duration_ms: u64,
    /// Effective priority the task ran with.
    pub actual_priority: u8,
    pub was_successful: bool,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// `POST /training/record` acknowledgement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingAck {
    pub recorded: bool,
    pub buffer_size: usize,
}

/// `POST /training/retrain` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrainResponse {
    pub retrained: bool,
    pub records_used: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_discriminant_branches() {
        let ready = PredictionOutcome::Ready(TaskPredictions::default());
        assert!(ready.is_ready());
        assert!(ready.into_option().is_some());

        let unavailable = PredictionOutcome::unavailable("timeout after 10000ms");
        assert!(!unavailable.is_ready());
        assert!(unavailable.into_option().is_none());
    }

    #[test]
    fn kinds_serialize_lowercase() {
        let json = serde_json::to_string(&PredictionKind::ALL.to_vec()).unwrap();
        assert_eq!(
            json,
            r#"["duration","priority","destination","anomaly","success","resource"]"#
        );
    }

    #[test]
    fn predict_request_captures_task_identity() {
        let task = Task::new(TaskType::ReportGeneration, "q3", 3);
        let request =
            PredictRequest::for_task(&task, TaskFeatures::default(), &PredictionKind::ALL);
        assert_eq!(request.task_id, task.id);
        assert_eq!(request.requested_kinds.len(), 6);
    }

    #[test]
    fn predict_response_decodes_without_optional_fields() {
        let response: PredictResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!response.success);
        assert!(response.predictions.is_none());
        assert_eq!(response.backend, "");
    }
}
