//! # Training Reporter
//!
//! Feeds observed outcomes back to the prediction service. Reports flow
//! through a bounded queue drained by a background task; the transport is
//! best-effort and the consume path never depends on it. A full queue
//! drops the report with a warning counter rather than blocking a worker.
//!
//! Requeued deliveries never produce training data; only terminal
//! outcomes do. Dead-lettered outcomes are reported as failures only when
//! the `report_dead_lettered` policy flag is set.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskrouter_shared::config::PredictionConfig;
use taskrouter_shared::metrics::ConsumerMetrics;
use taskrouter_shared::models::task::Task;
use taskrouter_shared::prediction::TrainingRecord;

/// Pending reports held while the drain task catches up.
const QUEUE_CAPACITY: usize = 256;

/// Handle used by workers to enqueue outcome reports.
#[derive(Clone)]
pub struct TrainingReporter {
    sender: mpsc::Sender<TrainingRecord>,
    report_dead_lettered: bool,
    metrics: ConsumerMetrics,
}

impl TrainingReporter {
    /// Start the reporter and its background drain task.
    pub fn spawn(
        config: &PredictionConfig,
        metrics: ConsumerMetrics,
        report_dead_lettered: bool,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(drain(
            receiver,
            config.base_url.clone(),
            config.timeout(),
            metrics.clone(),
        ));
        (
            Self {
                sender,
                report_dead_lettered,
                metrics,
            },
            handle,
        )
    }

    /// Report a successfully acknowledged task.
    pub fn report_success(&self, task: &Task, queue_name: &str) {
        self.enqueue(build_record(task, queue_name, true));
    }

    /// Report a dead-lettered task, when the policy flag allows it.
    pub fn report_dead_lettered(&self, task: &Task, queue_name: &str) {
        if !self.report_dead_lettered {
            return;
        }
        self.enqueue(build_record(task, queue_name, false));
    }

    fn enqueue(&self, record: TrainingRecord) {
        if let Err(e) = self.sender.try_send(record) {
            warn!(error = %e, "Training report queue full; report dropped");
            self.metrics
                .training_reports_total
                .with_label_values(&["dropped"])
                .inc();
        }
    }
}

/// Build the observation record from a terminal task.
pub fn build_record(task: &Task, queue_name: &str, was_successful: bool) -> TrainingRecord {
    TrainingRecord {
        task_id: task.id.clone(),
        task_type: task.task_type,
        features: task.features.clone(),
        actual_duration_ms: task.duration_ms.unwrap_or(0),
        actual_priority: task.effective_priority(),
        was_successful,
        queue_name: queue_name.to_string(),
        created_at: task.created_at,
        processed_at: task.completed_at.unwrap_or_else(Utc::now),
    }
}

async fn drain(
    mut receiver: mpsc::Receiver<TrainingRecord>,
    base_url: String,
    timeout: std::time::Duration,
    metrics: ConsumerMetrics,
) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Training reporter HTTP client failed to build; reports disabled");
            return;
        }
    };
    let url = format!("{base_url}/training/record");

    while let Some(record) = receiver.recv().await {
        let status = match client.post(&url).json(&record).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(task_id = %record.task_id, "Training record posted");
                "sent"
            }
            Ok(response) => {
                warn!(
                    task_id = %record.task_id,
                    status = %response.status(),
                    "Training record rejected"
                );
                "rejected"
            }
            Err(e) => {
                warn!(task_id = %record.task_id, error = %e, "Training record post failed");
                "failed"
            }
        };
        metrics
            .training_reports_total
            .with_label_values(&[status])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrouter_shared::models::predictions::TaskPredictions;
    use taskrouter_shared::models::task::TaskType;

    #[test]
    fn record_captures_effective_priority_and_duration() {
        let mut task = Task::new(TaskType::EmailNotification, "mail", 3);
        task.attach_predictions(TaskPredictions {
            task_id: task.id.clone(),
            calculated_priority: 9.0,
            ..Default::default()
        });
        task.mark_started();
        task.mark_completed();
        task.duration_ms = Some(1_800);

        let record = build_record(&task, "normal-priority-queue", true);
        assert_eq!(record.task_id, task.id);
        assert_eq!(record.actual_duration_ms, 1_800);
        assert_eq!(record.actual_priority, 7); // round(0.7*9 + 0.3*3)
        assert!(record.was_successful);
        assert_eq!(record.queue_name, "normal-priority-queue");
        assert_eq!(record.processed_at, task.completed_at.unwrap());
    }

    #[tokio::test]
    async fn dead_letter_reports_respect_the_policy_flag() {
        let metrics = ConsumerMetrics::new().unwrap();
        let config = PredictionConfig::default();

        let (reporter, _handle) = TrainingReporter::spawn(&config, metrics.clone(), false);
        let task = Task::new(TaskType::DataProcessing, "crunch", 5);
        reporter.report_dead_lettered(&task, "high-priority-queue");
        // Flag off: nothing enqueued, nothing dropped.
        assert_eq!(
            metrics
                .training_reports_total
                .with_label_values(&["dropped"])
                .get(),
            0
        );
    }
}
