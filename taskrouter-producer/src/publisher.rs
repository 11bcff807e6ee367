//! # Task Publisher
//!
//! The enrich → route → serialize → publish pipeline. Each publish runs
//! under a `send_ai_optimized_task` span whose context is injected into
//! the wire headers; the JSON body's `trace_id`/`span_id` fields are
//! stamped from the same span, informationally.
//!
//! Prediction failures degrade routing to the manual-priority fallback and
//! never fail the publish. Broker errors, including the overflow
//! rejection, surface to the caller.

use std::sync::Arc;
use std::time::Instant;

use lapin::BasicProperties;
use opentelemetry::trace::TraceContextExt;
use tracing::{debug, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use taskrouter_shared::messaging::headers;
use taskrouter_shared::messaging::{MessagingError, RabbitBroker};
use taskrouter_shared::metrics::ProducerMetrics;
use taskrouter_shared::models::task::Task;
use taskrouter_shared::routing::{self, RoutingDecision};

use crate::prediction::types::PredictionOutcome;
use crate::prediction::{PredictionClient, PredictionKind};

/// Publishes enriched tasks onto the priority topology.
pub struct TaskPublisher {
    broker: Arc<RabbitBroker>,
    prediction: Arc<PredictionClient>,
    metrics: ProducerMetrics,
}

/// Cache a prediction outcome on the task before routing.
pub fn apply_prediction_outcome(task: &mut Task, outcome: PredictionOutcome) {
    match outcome {
        PredictionOutcome::Ready(predictions) => task.attach_predictions(predictions),
        PredictionOutcome::Unavailable(reason) => {
            debug!(task_id = %task.id, reason = %reason, "Routing without predictions");
            task.record_prediction_unavailable(reason);
        }
    }
}

impl TaskPublisher {
    pub fn new(
        broker: Arc<RabbitBroker>,
        prediction: Arc<PredictionClient>,
        metrics: ProducerMetrics,
    ) -> Self {
        Self {
            broker,
            prediction,
            metrics,
        }
    }

    /// Enrich and publish one task. Returns the routing decision taken.
    pub async fn publish(&self, task: &mut Task) -> Result<RoutingDecision, MessagingError> {
        let span = tracing::info_span!(
            "send_ai_optimized_task",
            task_id = %task.id,
            task_type = %task.task_type,
            messaging.system = "rabbitmq",
        );
        async move {
            let started = Instant::now();
            let outcome = self
                .prediction
                .predict(task, &PredictionKind::ALL, None)
                .await;
            apply_prediction_outcome(task, outcome);

            let result = self.publish_prepared(task).await;

            self.metrics
                .task_send_duration_seconds
                .with_label_values(&[task.task_type.as_str()])
                .observe(started.elapsed().as_secs_f64());
            result
        }
        .instrument(span)
        .await
    }

    /// Route, serialize, and publish a task whose predictions (if any) are
    /// already cached. Runs inside the caller's span.
    pub async fn publish_prepared(
        &self,
        task: &mut Task,
    ) -> Result<RoutingDecision, MessagingError> {
        let decision = routing::route(task, task.predictions.as_ref());

        if let Some(note) = &decision.validation_note {
            warn!(task_id = %task.id, note = %note, "Routing validation note");
        }

        // Informational trace linkage in the body; the wire headers stay
        // authoritative.
        let span_context = tracing::Span::current()
            .context()
            .span()
            .span_context()
            .clone();
        if span_context.is_valid() {
            task.trace_id = Some(span_context.trace_id().to_string());
            task.span_id = Some(span_context.span_id().to_string());
        }

        let payload = serde_json::to_vec(task)
            .map_err(|e| MessagingError::serialization(e.to_string()))?;

        let mut wire_headers = headers::build_headers(task, &decision);
        headers::inject_current_context(&mut wire_headers);

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_priority(decision.wire_priority)
            .with_expiration(decision.ttl_ms.to_string().into())
            .with_headers(wire_headers);

        match self
            .broker
            .publish(&decision.exchange, &decision.routing_key, &payload, properties)
            .await
        {
            Ok(()) => {
                self.metrics
                    .tasks_sent_total
                    .with_label_values(&[
                        task.task_type.as_str(),
                        decision.destination.queue_name(),
                    ])
                    .inc();
                debug!(
                    task_id = %task.id,
                    destination = %decision.destination,
                    routing_key = %decision.routing_key,
                    wire_priority = decision.wire_priority,
                    reason = %decision.reason,
                    "Task published"
                );
                Ok(decision)
            }
            Err(e) => {
                tracing::error!(
                    task_id = %task.id,
                    destination = %decision.destination,
                    error = %e,
                    overflow = e.is_overflow(),
                    "Publish failed"
                );
                Err(e)
            }
        }
    }

    /// Batch publish: batch-predict first, then publish each task through
    /// the same decision/properties logic. Returns the success count.
    pub async fn publish_batch(&self, tasks: &mut [Task]) -> usize {
        let mut outcomes = self.prediction.predict_batch(tasks, None).await;

        let mut sent = 0;
        for task in tasks.iter_mut() {
            let outcome = outcomes
                .remove(&task.id)
                .unwrap_or_else(|| PredictionOutcome::unavailable("missing batch outcome"));
            apply_prediction_outcome(task, outcome);

            let span = tracing::info_span!(
                "send_ai_optimized_task",
                task_id = %task.id,
                task_type = %task.task_type,
                messaging.system = "rabbitmq",
            );
            match self.publish_prepared(task).instrument(span).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Batch publish item failed");
                }
            }
        }
        sent
    }

    /// Current depth of a destination queue, for backpressure observation.
    pub async fn queue_depth(
        &self,
        destination: taskrouter_shared::Destination,
    ) -> Result<u32, MessagingError> {
        self.broker.queue_depth(destination).await
    }
}
