//! # Task Model
//!
//! The unit of work flowing from submission through the broker to a
//! handler. Tasks serialize to the stable JSON wire format; the retry and
//! timing fields are mutated only by consumer workers, the AI augmentation
//! fields only by the publisher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::features::TaskFeatures;
use super::predictions::{self, TaskPredictions};

/// Entries kept in a task's `error_history`.
const ERROR_HISTORY_LIMIT: usize = 10;

/// Closed catalog of task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    DataProcessing,
    ReportGeneration,
    EmailNotification,
    ImageProcessing,
    DataExport,
    WebScraping,
    DataBackup,
    SystemMaintenance,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::DataProcessing,
        TaskType::ReportGeneration,
        TaskType::EmailNotification,
        TaskType::ImageProcessing,
        TaskType::DataExport,
        TaskType::WebScraping,
        TaskType::DataBackup,
        TaskType::SystemMaintenance,
    ];

    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::DataProcessing => "DataProcessing",
            TaskType::ReportGeneration => "ReportGeneration",
            TaskType::EmailNotification => "EmailNotification",
            TaskType::ImageProcessing => "ImageProcessing",
            TaskType::DataExport => "DataExport",
            TaskType::WebScraping => "WebScraping",
            TaskType::DataBackup => "DataBackup",
            TaskType::SystemMaintenance => "SystemMaintenance",
        }
    }

    /// Parse a wire name back into the catalog.
    pub fn parse(name: &str) -> Option<TaskType> {
        TaskType::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Baseline input size used when a submission carries no `size_bytes`.
    pub fn baseline_input_bytes(&self) -> u64 {
        match self {
            TaskType::DataProcessing => 5 * 1024 * 1024,
            TaskType::ReportGeneration => 512 * 1024,
            TaskType::EmailNotification => 4 * 1024,
            TaskType::ImageProcessing => 8 * 1024 * 1024,
            TaskType::DataExport => 20 * 1024 * 1024,
            TaskType::WebScraping => 256 * 1024,
            TaskType::DataBackup => 100 * 1024 * 1024,
            TaskType::SystemMaintenance => 16 * 1024,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque globally-unique id, assigned at creation and never mutated.
    pub id: String,
    pub task_type: TaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Submitter-assigned priority, 0-10.
    #[serde(default)]
    pub manual_priority: u8,
    /// Explicit routing key override; rarely set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<String>,

    /// Trace linkage of the publishing span. Informational only: the W3C
    /// AMQP headers are authoritative for context propagation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Untyped submission parameters; projected to a typed per-task-type
    /// view at the consumer boundary.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<TaskFeatures>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<TaskPredictions>,
    #[serde(default)]
    pub ai_processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_error: Option<String>,
}

impl Task {
    /// Create a task with a fresh UUID and a clamped manual priority.
    pub fn new(task_type: TaskType, title: impl Into<String>, manual_priority: u8) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            title: title.into(),
            description: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            manual_priority: manual_priority.min(10),
            routing_key: None,
            retry_count: 0,
            max_retries: 3,
            last_retry_at: None,
            last_error: None,
            error_history: Vec::new(),
            trace_id: None,
            span_id: None,
            parameters: HashMap::new(),
            features: None,
            predictions: None,
            ai_processed: false,
            ai_processed_at: None,
            ai_error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_features(mut self, features: TaskFeatures) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Blend of AI and manual priority on the 0-10 scale.
    pub fn effective_priority(&self) -> u8 {
        predictions::effective_priority(self.manual_priority, self.predictions.as_ref())
    }

    /// Attach a prediction set and stamp `ai_processed_at`.
    pub fn attach_predictions(&mut self, predictions: TaskPredictions) {
        self.predictions = Some(predictions);
        self.ai_processed = true;
        self.ai_processed_at = Some(Utc::now());
        self.ai_error = None;
    }

    /// Record that prediction was unavailable for this publish.
    pub fn record_prediction_unavailable(&mut self, reason: impl Into<String>) {
        self.ai_processed = false;
        self.ai_error = Some(reason.into());
    }

    /// Stamp handler start time.
    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Stamp completion and derive `duration_ms` from `started_at`.
    ///
    /// Once set, the task is terminal: no further retries are recorded.
    pub fn mark_completed(&mut self) {
        let completed = Utc::now();
        self.completed_at = Some(completed);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((completed - started).num_milliseconds().max(0) as u64);
        }
    }

    /// Whether a terminal completion has been recorded.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Record a handler failure: bounded error history, last-error fields,
    /// and the retry counter.
    ///
    /// No-op once `completed_at` is set.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        if self.is_completed() {
            return;
        }
        let error = error.into();
        if self.error_history.len() >= ERROR_HISTORY_LIMIT {
            self.error_history.remove(0);
        }
        self.error_history.push(error.clone());
        self.last_error = Some(error);
        self.last_retry_at = Some(Utc::now());
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Record an error without touching the retry counter. Used on the
    /// dead-letter path, where the budget is already spent and
    /// `retry_count` must not exceed `max_retries`.
    pub fn note_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        if self.error_history.len() >= ERROR_HISTORY_LIMIT {
            self.error_history.remove(0);
        }
        self.error_history.push(error.clone());
        self.last_error = Some(error);
    }

    /// Queue wait observed at delivery time.
    pub fn queue_wait(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_has_unique_id_and_clamped_priority() {
        let a = Task::new(TaskType::EmailNotification, "welcome mail", 4);
        let b = Task::new(TaskType::EmailNotification, "welcome mail", 12);
        assert_ne!(a.id, b.id);
        assert_eq!(a.manual_priority, 4);
        assert_eq!(b.manual_priority, 10);
        assert!(!a.ai_processed);
    }

    #[test]
    fn task_type_parse_round_trips() {
        for t in TaskType::ALL {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TaskType::parse("Unknown"), None);
    }

    #[test]
    fn record_failure_bounds_history() {
        let mut task = Task::new(TaskType::DataProcessing, "crunch", 5);
        for i in 0..15 {
            task.record_failure(format!("attempt {i} failed"));
        }
        assert_eq!(task.error_history.len(), 10);
        assert_eq!(task.error_history[0], "attempt 5 failed");
        assert_eq!(task.last_error.as_deref(), Some("attempt 14 failed"));
        assert_eq!(task.retry_count, 15);
    }

    #[test]
    fn completed_task_ignores_further_failures() {
        let mut task = Task::new(TaskType::ReportGeneration, "q3 report", 6);
        task.mark_started();
        task.mark_completed();
        let retries_before = task.retry_count;
        task.record_failure("late failure");
        assert_eq!(task.retry_count, retries_before);
        assert!(task.last_error.is_none());
    }

    #[test]
    fn mark_completed_derives_duration() {
        let mut task = Task::new(TaskType::EmailNotification, "mail", 4);
        task.mark_started();
        task.mark_completed();
        assert!(task.duration_ms.is_some());
    }

    #[test]
    fn attach_predictions_stamps_ai_fields() {
        let mut task = Task::new(TaskType::DataExport, "dump", 2);
        task.record_prediction_unavailable("timeout");
        assert_eq!(task.ai_error.as_deref(), Some("timeout"));

        task.attach_predictions(TaskPredictions {
            task_id: task.id.clone(),
            calculated_priority: 6.0,
            ..Default::default()
        });
        assert!(task.ai_processed);
        assert!(task.ai_processed_at.is_some());
        assert!(task.ai_error.is_none());
        assert_eq!(task.effective_priority(), 5); // round(0.7*6 + 0.3*2)
    }

    #[test]
    fn json_round_trip_preserves_declared_fields() {
        let mut task = Task::new(TaskType::WebScraping, "crawl docs", 7)
            .with_description("nightly crawl")
            .with_parameter("target_url", serde_json::json!("https://example.com"));
        task.record_failure("dns failure");
        task.trace_id = Some("4bf92f3577b34da6a3ce929d0e0e4736".into());
        task.span_id = Some("00f067aa0ba902b7".into());

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let task = Task::new(TaskType::DataBackup, "backup", 1);
        let mut value = serde_json::to_value(&task).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("added_in_v9".into(), serde_json::json!({"x": 1}));
        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, task.id);
    }
}
