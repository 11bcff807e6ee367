//! # Destination Consumer
//!
//! One logical consumer per destination: its own channel, its own
//! `basic_qos` prefetch, and a semaphore bounding parallel handler
//! invocations. Each delivery walks the state machine
//! RECEIVED → PARSED → IN-FLIGHT → {ACKED, REQUEUED, DEAD-LETTERED}.
//!
//! Retries republish the mutated task (incremented `retry-count`, updated
//! error history) to the same exchange and routing key, then acknowledge
//! the original delivery; the broker's redelivery therefore carries the
//! incremented counter on both the wire headers and the body, and the
//! message that finally dead-letters preserves the last retry state.
//! Retry delays are interruptible by the shutdown signal, and so is the
//! handler itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use taskrouter_shared::messaging::headers::{self, MessageHeaders};
use taskrouter_shared::messaging::MessagingError;
use taskrouter_shared::metrics::ConsumerMetrics;
use taskrouter_shared::models::destination::{ConsumerPolicy, Destination};
use taskrouter_shared::models::task::{Task, TaskType};
use taskrouter_shared::routing::RoutingDecision;

use crate::handlers::{self, HandlerRegistry};
use crate::training::TrainingReporter;

/// Terminal and non-terminal dispositions of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

/// Retry-vs-DLQ decision for a failed delivery.
///
/// `retry_count` is the count carried by the delivery before this
/// failure; the budget is `max_retries` retries after the original
/// attempt, so handler invocations per task never exceed
/// `max_retries + 1`.
pub fn failure_disposition(retry_count: u32, max_retries: u32) -> DeliveryOutcome {
    if retry_count < max_retries {
        DeliveryOutcome::Requeued
    } else {
        DeliveryOutcome::DeadLettered
    }
}

/// Retry delay with the optional bounded jitter applied.
pub fn retry_delay(base: Duration, jitter_enabled: bool, max_jitter: f64) -> Duration {
    if !jitter_enabled || max_jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::random::<f64>() * max_jitter.min(1.0);
    base.mul_f64(factor)
}

/// Rolling counters for the pool's introspection loop.
#[derive(Debug, Default)]
pub struct DestinationStats {
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub handler_latency_ms_total: AtomicU64,
}

/// Per-delivery shared context.
struct WorkerContext {
    destination: Destination,
    policy: ConsumerPolicy,
    channel: Channel,
    registry: Arc<HandlerRegistry>,
    metrics: ConsumerMetrics,
    training: TrainingReporter,
    stats: Arc<DestinationStats>,
    jitter_enabled: bool,
    max_jitter: f64,
}

/// One logical consumer bound to a destination queue.
pub struct DestinationConsumer {
    context: Arc<WorkerContext>,
    shutdown: watch::Receiver<bool>,
}

impl DestinationConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination: Destination,
        policy: ConsumerPolicy,
        channel: Channel,
        registry: Arc<HandlerRegistry>,
        metrics: ConsumerMetrics,
        training: TrainingReporter,
        stats: Arc<DestinationStats>,
        jitter_enabled: bool,
        max_jitter: f64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                destination,
                policy,
                channel,
                registry,
                metrics,
                training,
                stats,
                jitter_enabled,
                max_jitter,
            }),
            shutdown,
        }
    }

    /// Set prefetch, register the consumer, and process deliveries until
    /// shutdown. Waits for in-flight handlers before returning.
    pub async fn run(mut self) -> Result<(), MessagingError> {
        let ctx = self.context.clone();
        let queue_name = ctx.destination.queue_name();

        ctx.channel
            .basic_qos(ctx.policy.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::consume(queue_name, format!("basic_qos failed: {e}")))?;

        let mut consumer = ctx
            .channel
            .basic_consume(
                queue_name,
                &format!("taskrouter-{}", ctx.destination),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::consume(queue_name, format!("basic_consume failed: {e}")))?;

        info!(
            queue = queue_name,
            concurrency = ctx.policy.concurrency,
            prefetch = ctx.policy.prefetch,
            max_retries = ctx.policy.max_retries,
            "Consumer started"
        );

        let semaphore = Arc::new(Semaphore::new(ctx.policy.concurrency));
        loop {
            tokio::select! {
                maybe_delivery = consumer.next() => {
                    match maybe_delivery {
                        Some(Ok(delivery)) => {
                            let permit = match semaphore.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let ctx = ctx.clone();
                            let shutdown_rx = self.shutdown.clone();
                            tokio::spawn(async move {
                                handle_delivery(ctx, delivery, shutdown_rx).await;
                                drop(permit);
                            });
                        }
                        Some(Err(e)) => {
                            warn!(queue = queue_name, error = %e, "Consume stream error");
                        }
                        None => {
                            warn!(queue = queue_name, "Consume stream closed");
                            break;
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain: hold every permit so in-flight handlers have finished.
        let _ = semaphore
            .acquire_many(ctx.policy.concurrency as u32)
            .await;
        info!(queue = queue_name, "Consumer stopped");
        Ok(())
    }
}

/// A `process_task_<type>` span for the handler invocation.
fn process_span(task_type: TaskType) -> tracing::Span {
    match task_type {
        TaskType::DataProcessing => tracing::info_span!("process_task_DataProcessing"),
        TaskType::ReportGeneration => tracing::info_span!("process_task_ReportGeneration"),
        TaskType::EmailNotification => tracing::info_span!("process_task_EmailNotification"),
        TaskType::ImageProcessing => tracing::info_span!("process_task_ImageProcessing"),
        TaskType::DataExport => tracing::info_span!("process_task_DataExport"),
        TaskType::WebScraping => tracing::info_span!("process_task_WebScraping"),
        TaskType::DataBackup => tracing::info_span!("process_task_DataBackup"),
        TaskType::SystemMaintenance => tracing::info_span!("process_task_SystemMaintenance"),
    }
}

/// Wait until the shutdown signal flips to true.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_delivery(
    ctx: Arc<WorkerContext>,
    delivery: Delivery,
    shutdown_rx: watch::Receiver<bool>,
) {
    let queue_name = ctx.destination.queue_name();
    let header_table = delivery
        .properties
        .headers()
        .clone()
        .unwrap_or_default();

    // The wire headers are authoritative for trace linkage.
    let parent_context = headers::extract_context(&header_table);
    let span = tracing::info_span!(
        "consume_priority_task",
        queue = queue_name,
        messaging.system = "rabbitmq",
    );
    span.set_parent(parent_context);

    process_delivery(ctx, delivery, header_table, shutdown_rx)
        .instrument(span)
        .await;
}

async fn process_delivery(
    ctx: Arc<WorkerContext>,
    delivery: Delivery,
    header_table: FieldTable,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let queue_name = ctx.destination.queue_name();

    // RECEIVED -> PARSED: headers first, then the JSON body. Either
    // failing is terminal for the delivery.
    let parsed_headers = match MessageHeaders::parse(&header_table) {
        Ok(parsed) => parsed,
        Err(e) => {
            reject_unparseable(&ctx, &delivery, &format!("headers: {e}")).await;
            return;
        }
    };
    let mut task: Task = match serde_json::from_slice(&delivery.data) {
        Ok(task) => task,
        Err(e) => {
            reject_unparseable(&ctx, &delivery, &format!("body: {e}")).await;
            return;
        }
    };

    let queue_wait = task.queue_wait(Utc::now());
    ctx.metrics
        .queue_wait_time_seconds
        .with_label_values(&[queue_name])
        .set(queue_wait.num_milliseconds() as f64 / 1_000.0);
    debug!(
        task_id = %task.id,
        retry_count = parsed_headers.retry_count,
        queue_wait_ms = queue_wait.num_milliseconds(),
        "Delivery received"
    );

    // PARSED -> IN-FLIGHT.
    task.mark_started();
    let handler_started = Instant::now();
    let invocation = handlers::invoke(ctx.destination, &ctx.registry, &task)
        .instrument(process_span(task.task_type));
    let result = tokio::select! {
        result = invocation => Some(result),
        _ = shutdown_signalled(&mut shutdown_rx) => None,
    };
    let handler_elapsed = handler_started.elapsed();
    ctx.stats
        .handler_latency_ms_total
        .fetch_add(handler_elapsed.as_millis() as u64, Ordering::Relaxed);

    match result {
        Some(Ok(())) => complete_delivery(&ctx, delivery, &mut task, handler_elapsed).await,
        Some(Err(e)) => {
            fail_delivery(
                &ctx,
                delivery,
                &mut task,
                &parsed_headers,
                e.to_string(),
                &mut shutdown_rx,
            )
            .await
        }
        None => {
            // Shutdown cancelled the handler. The handler had started, so
            // the attempt counts against the retry budget; requeue without
            // the usual delay so shutdown stays prompt.
            warn!(task_id = %task.id, "Handler cancelled by shutdown; requeueing");
            match failure_disposition(task.retry_count, ctx.policy.max_retries) {
                DeliveryOutcome::Requeued => {
                    task.record_failure("cancelled by shutdown");
                    requeue_now(&ctx, delivery, &task, &parsed_headers).await;
                }
                _ => dead_letter(&ctx, delivery, &mut task, "cancelled by shutdown").await,
            }
        }
    }
}

async fn reject_unparseable(ctx: &WorkerContext, delivery: &Delivery, detail: &str) {
    let queue_name = ctx.destination.queue_name();
    warn!(queue = queue_name, detail = %detail, "Unparseable delivery; dead-lettering");
    ctx.metrics
        .parse_errors_total
        .with_label_values(&[queue_name])
        .inc();
    if let Err(e) = delivery
        .acker
        .nack(BasicNackOptions {
            requeue: false,
            ..Default::default()
        })
        .await
    {
        warn!(error = %e, "Nack of unparseable delivery failed");
    }
}

async fn complete_delivery(
    ctx: &WorkerContext,
    delivery: Delivery,
    task: &mut Task,
    handler_elapsed: Duration,
) {
    let queue_name = ctx.destination.queue_name();
    task.mark_completed();

    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
        warn!(task_id = %task.id, error = %e, "Ack failed; delivery will be redelivered");
        return;
    }

    ctx.metrics
        .tasks_processed_total
        .with_label_values(&[task.task_type.as_str(), queue_name, "acked"])
        .inc();
    ctx.metrics
        .task_processing_duration_seconds
        .with_label_values(&[task.task_type.as_str()])
        .observe(handler_elapsed.as_secs_f64());
    ctx.stats.acked.fetch_add(1, Ordering::Relaxed);

    ctx.training.report_success(task, queue_name);
    debug!(
        task_id = %task.id,
        duration_ms = task.duration_ms.unwrap_or(0),
        "Task acked"
    );
}

async fn fail_delivery(
    ctx: &WorkerContext,
    delivery: Delivery,
    task: &mut Task,
    parsed_headers: &MessageHeaders,
    error: String,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let queue_name = ctx.destination.queue_name();

    match failure_disposition(task.retry_count, ctx.policy.max_retries) {
        DeliveryOutcome::Requeued => {
            task.record_failure(error.as_str());
            let delay = retry_delay(ctx.policy.retry_delay, ctx.jitter_enabled, ctx.max_jitter);
            warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = ctx.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Handler failed; requeueing after delay"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    requeue_now(ctx, delivery, task, parsed_headers).await;
                }
                _ = shutdown_signalled(shutdown_rx) => {
                    // Delay interrupted: hand the original back untouched.
                    if let Err(e) = delivery
                        .acker
                        .nack(BasicNackOptions { requeue: true, ..Default::default() })
                        .await
                    {
                        warn!(task_id = %task.id, error = %e, "Requeue nack failed during shutdown");
                    }
                    ctx.stats.requeued.fetch_add(1, Ordering::Relaxed);
                }
            }
            ctx.metrics
                .tasks_processed_total
                .with_label_values(&[task.task_type.as_str(), queue_name, "requeued"])
                .inc();
        }
        DeliveryOutcome::DeadLettered => dead_letter(ctx, delivery, task, &error).await,
        DeliveryOutcome::Acked => unreachable!("failure_disposition never returns Acked"),
    }
}

/// Republish the mutated task to its original routing and ack the
/// original delivery, so the redelivery carries the incremented retry
/// state. Falls back to a plain requeue nack if the republish fails.
async fn requeue_now(
    ctx: &WorkerContext,
    delivery: Delivery,
    task: &Task,
    parsed_headers: &MessageHeaders,
) {
    let decision = RoutingDecision {
        destination: ctx.destination,
        exchange: ctx.destination.exchange().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        wire_priority: delivery.properties.priority().unwrap_or(0),
        ttl_ms: ctx.destination.message_ttl_ms(),
        reason: parsed_headers
            .routing_reason
            .clone()
            .unwrap_or_else(|| "fallback: predictions unavailable".to_string()),
        validation_note: None,
    };

    match republish(ctx, task, &decision).await {
        Ok(()) => {
            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                warn!(task_id = %task.id, error = %e, "Ack after requeue republish failed");
            }
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Requeue republish failed; nacking with requeue");
            if let Err(e) = delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                warn!(task_id = %task.id, error = %e, "Requeue nack failed");
            }
        }
    }
    ctx.stats.requeued.fetch_add(1, Ordering::Relaxed);
}

async fn republish(
    ctx: &WorkerContext,
    task: &Task,
    decision: &RoutingDecision,
) -> Result<(), MessagingError> {
    let payload =
        serde_json::to_vec(task).map_err(|e| MessagingError::serialization(e.to_string()))?;
    let mut wire_headers = headers::build_headers(task, decision);
    headers::inject_current_context(&mut wire_headers);

    let properties = BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_priority(decision.wire_priority)
        .with_expiration(decision.ttl_ms.to_string().into())
        .with_headers(wire_headers);

    let _confirm = ctx
        .channel
        .basic_publish(
            &decision.exchange,
            &decision.routing_key,
            BasicPublishOptions::default(),
            &payload,
            properties,
        )
        .await
        .map_err(|e| MessagingError::send(decision.routing_key.clone(), e.to_string()))?;
    Ok(())
}

async fn dead_letter(ctx: &WorkerContext, delivery: Delivery, task: &mut Task, error: &str) {
    let queue_name = ctx.destination.queue_name();
    task.note_error(error);
    warn!(
        task_id = %task.id,
        retry_count = task.retry_count,
        error = %error,
        "Retry budget exhausted; dead-lettering"
    );

    if let Err(e) = delivery
        .acker
        .nack(BasicNackOptions {
            requeue: false,
            ..Default::default()
        })
        .await
    {
        warn!(task_id = %task.id, error = %e, "Dead-letter nack failed");
        return;
    }

    ctx.metrics
        .tasks_processed_total
        .with_label_values(&[task.task_type.as_str(), queue_name, "dead_lettered"])
        .inc();
    ctx.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
    ctx.training.report_dead_lettered(task, queue_name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_honors_the_retry_budget() {
        // high destination: max_retries = 3. Deliveries carry the count
        // accumulated by previous failures.
        assert_eq!(failure_disposition(0, 3), DeliveryOutcome::Requeued);
        assert_eq!(failure_disposition(2, 3), DeliveryOutcome::Requeued);
        // Third retry was the last: delivery 4 dead-letters.
        assert_eq!(failure_disposition(3, 3), DeliveryOutcome::DeadLettered);
    }

    #[test]
    fn invocation_count_never_exceeds_budget_plus_one() {
        for max_retries in [0u32, 1, 2, 3, 5] {
            let mut invocations = 0;
            let mut retry_count = 0;
            loop {
                invocations += 1; // every delivery invokes the handler once
                match failure_disposition(retry_count, max_retries) {
                    DeliveryOutcome::Requeued => retry_count += 1,
                    _ => break,
                }
            }
            assert_eq!(invocations, max_retries + 1);
            assert!(retry_count <= max_retries);
        }
    }

    #[test]
    fn anomaly_budget_allows_a_single_retry() {
        let policy = Destination::Anomaly.default_policy();
        assert_eq!(
            failure_disposition(0, policy.max_retries),
            DeliveryOutcome::Requeued
        );
        assert_eq!(
            failure_disposition(1, policy.max_retries),
            DeliveryOutcome::DeadLettered
        );
    }

    #[test]
    fn retry_delay_is_deterministic_without_jitter() {
        let base = Duration::from_secs(2);
        assert_eq!(retry_delay(base, false, 0.1), base);
        assert_eq!(retry_delay(base, true, 0.0), base);
    }

    #[test]
    fn retry_delay_jitter_stays_bounded() {
        let base = Duration::from_secs(2);
        for _ in 0..100 {
            let delayed = retry_delay(base, true, 0.1);
            assert!(delayed >= base);
            assert!(delayed <= base.mul_f64(1.1));
        }
    }

    #[test]
    fn process_spans_are_named_per_type() {
        // Span construction must not panic for any catalog type.
        for task_type in TaskType::ALL {
            let _span = process_span(task_type);
        }
    }
}
