//! # Task Predictions
//!
//! Outputs of the prediction service, owned by value on the task. The only
//! back-reference to the task is `task_id`; predictions never hold task
//! state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Estimated resource consumption for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_kbps: f64,
}

/// Full prediction set attached to a task at publish time.
///
/// `recommended_destination` stays a raw string on the wire: the service
/// may emit names outside the catalog and the routing engine is the single
/// place that validates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPredictions {
    /// Id of the task these predictions were computed for.
    pub task_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_duration_ms: Option<f64>,
    /// Confidence in `predicted_duration_ms`, 0.0 to 1.0.
    #[serde(default)]
    pub duration_confidence: f64,

    /// Model-calculated priority on the human 0-10 scale.
    #[serde(default)]
    pub calculated_priority: f64,
    /// Normalized priority score, 0.0 to 1.0.
    #[serde(default)]
    pub priority_score: f64,
    /// Human-readable explanation of the priority decision.
    #[serde(default)]
    pub priority_reason: String,
    /// Contributing factor name to weight.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub priority_factors: HashMap<String, f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_destination: Option<String>,
    #[serde(default)]
    pub destination_confidence: f64,

    #[serde(default)]
    pub is_anomaly: bool,
    #[serde(default)]
    pub anomaly_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomaly_tags: Vec<String>,

    #[serde(default)]
    pub success_probability: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceEstimate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization_hints: Vec<String>,

    /// Version tag of the model that produced this set.
    #[serde(default)]
    pub model_version: String,
    /// End-to-end prediction latency observed by the service.
    #[serde(default)]
    pub prediction_time_ms: f64,
}

/// Blend of AI and manual priority on the human 0-10 scale.
///
/// `round(0.7 * calculated + 0.3 * manual)` when predictions are present,
/// the manual priority alone otherwise.
pub fn effective_priority(manual_priority: u8, predictions: Option<&TaskPredictions>) -> u8 {
    match predictions {
        Some(p) => {
            let blended = 0.7 * p.calculated_priority + 0.3 * f64::from(manual_priority);
            blended.round().clamp(0.0, 10.0) as u8
        }
        None => manual_priority.min(10),
    }
}
