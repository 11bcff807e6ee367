//! # Metrics
//!
//! Prometheus instruments behind per-role handle structs. Each struct owns
//! its instruments and registers them on a shared `Registry`; the registry
//! is the single source of truth for a process, created once at startup
//! and rendered by the `/metrics` endpoint. Tests construct fresh
//! instances instead of resetting globals.
//!
//! Metric names are part of the wire contract and must not change:
//! `producer_tasks_sent_total`, `producer_task_send_duration_seconds`,
//! `consumer_tasks_processed_total`,
//! `consumer_task_processing_duration_seconds`,
//! `consumer_queue_wait_time_seconds`, `ai_predictions_total`,
//! `ai_prediction_latency_seconds`, `ai_model_ready`.

use std::sync::Arc;

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::errors::TaskRouterResult;

/// Render a registry in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> TaskRouterResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(crate::errors::TaskRouterError::from)?;
    String::from_utf8(buffer)
        .map_err(|e| crate::errors::TaskRouterError::Internal(format!("metrics encoding: {e}")))
}

/// Publisher-side instruments.
#[derive(Clone)]
pub struct ProducerMetrics {
    registry: Arc<Registry>,
    pub tasks_sent_total: IntCounterVec,
    pub task_send_duration_seconds: HistogramVec,
}

impl ProducerMetrics {
    pub fn new() -> TaskRouterResult<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    pub fn with_registry(registry: Arc<Registry>) -> TaskRouterResult<Self> {
        let tasks_sent_total = IntCounterVec::new(
            Opts::new(
                "producer_tasks_sent_total",
                "Total tasks published, by task type and destination queue",
            ),
            &["task_type", "queue_name"],
        )?;
        let task_send_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "producer_task_send_duration_seconds",
                "End-to-end publish latency including prediction and routing",
            ),
            &["task_type"],
        )?;

        registry.register(Box::new(tasks_sent_total.clone()))?;
        registry.register(Box::new(task_send_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            tasks_sent_total,
            task_send_duration_seconds,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn render_metrics(&self) -> TaskRouterResult<String> {
        render(&self.registry)
    }
}

/// Consumer-side instruments.
#[derive(Clone)]
pub struct ConsumerMetrics {
    registry: Arc<Registry>,
    pub tasks_processed_total: IntCounterVec,
    pub task_processing_duration_seconds: HistogramVec,
    pub queue_wait_time_seconds: GaugeVec,
    pub parse_errors_total: IntCounterVec,
    pub training_reports_total: IntCounterVec,
}

impl ConsumerMetrics {
    pub fn new() -> TaskRouterResult<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    pub fn with_registry(registry: Arc<Registry>) -> TaskRouterResult<Self> {
        let tasks_processed_total = IntCounterVec::new(
            Opts::new(
                "consumer_tasks_processed_total",
                "Terminal delivery outcomes, by task type, queue, and status",
            ),
            &["task_type", "queue_name", "status"],
        )?;
        let task_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "consumer_task_processing_duration_seconds",
                "Handler execution time",
            ),
            &["task_type"],
        )?;
        let queue_wait_time_seconds = GaugeVec::new(
            Opts::new(
                "consumer_queue_wait_time_seconds",
                "Delivery-observed wait between task creation and consumption",
            ),
            &["queue_name"],
        )?;
        let parse_errors_total = IntCounterVec::new(
            Opts::new(
                "consumer_parse_errors_total",
                "Deliveries dropped to the DLQ because body or headers failed to parse",
            ),
            &["queue_name"],
        )?;
        let training_reports_total = IntCounterVec::new(
            Opts::new(
                "consumer_training_reports_total",
                "Training feedback posts, by outcome status",
            ),
            &["status"],
        )?;

        registry.register(Box::new(tasks_processed_total.clone()))?;
        registry.register(Box::new(task_processing_duration_seconds.clone()))?;
        registry.register(Box::new(queue_wait_time_seconds.clone()))?;
        registry.register(Box::new(parse_errors_total.clone()))?;
        registry.register(Box::new(training_reports_total.clone()))?;

        Ok(Self {
            registry,
            tasks_processed_total,
            task_processing_duration_seconds,
            queue_wait_time_seconds,
            parse_errors_total,
            training_reports_total,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn render_metrics(&self) -> TaskRouterResult<String> {
        render(&self.registry)
    }
}

/// Prediction client instruments, shared by both roles.
#[derive(Clone)]
pub struct PredictionMetrics {
    registry: Arc<Registry>,
    pub predictions_total: IntCounterVec,
    pub prediction_latency_seconds: HistogramVec,
    pub model_ready: IntGaugeVec,
}

impl PredictionMetrics {
    pub fn new() -> TaskRouterResult<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    pub fn with_registry(registry: Arc<Registry>) -> TaskRouterResult<Self> {
        let predictions_total = IntCounterVec::new(
            Opts::new(
                "ai_predictions_total",
                "Prediction calls, by backend, prediction type, and outcome",
            ),
            &["backend", "type", "status"],
        )?;
        let prediction_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ai_prediction_latency_seconds",
                "Observed prediction call latency",
            ),
            &["backend"],
        )?;
        let model_ready = IntGaugeVec::new(
            Opts::new("ai_model_ready", "Whether a model reports ready (1) or not (0)"),
            &["model"],
        )?;

        registry.register(Box::new(predictions_total.clone()))?;
        registry.register(Box::new(prediction_latency_seconds.clone()))?;
        registry.register(Box::new(model_ready.clone()))?;

        Ok(Self {
            registry,
            predictions_total,
            prediction_latency_seconds,
            model_ready,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_metrics_render_stable_names() {
        let metrics = ProducerMetrics::new().unwrap();
        metrics
            .tasks_sent_total
            .with_label_values(&["EmailNotification", "normal-priority-queue"])
            .inc();
        metrics
            .task_send_duration_seconds
            .with_label_values(&["EmailNotification"])
            .observe(0.012);

        let rendered = metrics.render_metrics().unwrap();
        assert!(rendered.contains("producer_tasks_sent_total"));
        assert!(rendered.contains("producer_task_send_duration_seconds"));
        assert!(rendered.contains("queue_name=\"normal-priority-queue\""));
    }

    #[test]
    fn consumer_metrics_track_outcome_status() {
        let metrics = ConsumerMetrics::new().unwrap();
        metrics
            .tasks_processed_total
            .with_label_values(&["DataProcessing", "high-priority-queue", "acked"])
            .inc();
        metrics
            .queue_wait_time_seconds
            .with_label_values(&["high-priority-queue"])
            .set(1.5);
        metrics
            .parse_errors_total
            .with_label_values(&["high-priority-queue"])
            .inc();

        let rendered = metrics.render_metrics().unwrap();
        assert!(rendered.contains("consumer_tasks_processed_total"));
        assert!(rendered.contains("status=\"acked\""));
        assert!(rendered.contains("consumer_queue_wait_time_seconds"));
        assert!(rendered.contains("consumer_parse_errors_total"));
    }

    #[test]
    fn roles_can_share_one_registry() {
        let registry = Arc::new(Registry::new());
        let producer = ProducerMetrics::with_registry(registry.clone()).unwrap();
        let prediction = PredictionMetrics::with_registry(registry.clone()).unwrap();

        producer
            .tasks_sent_total
            .with_label_values(&["DataExport", "batch-queue"])
            .inc();
        prediction
            .predictions_total
            .with_label_values(&["hybrid", "all", "success"])
            .inc();
        prediction.model_ready.with_label_values(&["hybrid"]).set(1);

        let rendered = render(&registry).unwrap();
        assert!(rendered.contains("producer_tasks_sent_total"));
        assert!(rendered.contains("ai_predictions_total"));
        assert!(rendered.contains("ai_model_ready"));
    }

    #[test]
    fn fresh_instances_are_independent() {
        // Registration on separate registries must not collide, so tests
        // can construct as many instances as they need.
        let a = PredictionMetrics::new().unwrap();
        let b = PredictionMetrics::new().unwrap();
        a.predictions_total
            .with_label_values(&["hybrid", "duration", "success"])
            .inc();
        assert_eq!(
            b.predictions_total
                .with_label_values(&["hybrid", "duration", "success"])
                .get(),
            0
        );
    }
}
