//! # Wire Message Headers
//!
//! The stable AMQP header catalog and the W3C trace-context codec. Headers
//! are authoritative for trace propagation across the broker hop; the JSON
//! body's `trace_id`/`span_id` fields are informational only.

use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::propagation::{Extractor, Injector};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::errors::MessagingError;
use crate::models::predictions::TaskPredictions;
use crate::models::task::Task;
use crate::routing::RoutingDecision;

pub const HEADER_TRACEPARENT: &str = "traceparent";
pub const HEADER_TRACESTATE: &str = "tracestate";
pub const HEADER_TASK_TYPE: &str = "task-type";
pub const HEADER_TASK_ID: &str = "task-id";
pub const HEADER_RETRY_COUNT: &str = "retry-count";
pub const HEADER_MAX_RETRIES: &str = "max-retries";
pub const HEADER_AI_PROCESSED: &str = "ai-processed";
pub const HEADER_ROUTING_REASON: &str = "routing-reason";
pub const HEADER_QUEUE_RECOMMENDATION: &str = "queue-recommendation";
pub const HEADER_AI_PRIORITY: &str = "ai-priority";
pub const HEADER_AI_DURATION_MS: &str = "ai-duration-ms";
pub const HEADER_AI_IS_ANOMALY: &str = "ai-is-anomaly";
pub const HEADER_AI_SUCCESS_PROBABILITY: &str = "ai-success-probability";
pub const HEADER_AI_SERVICE_VERSION: &str = "ai-service-version";

/// Every header the publisher may set. Published messages never carry a
/// header outside this catalog.
pub const HEADER_CATALOG: &[&str] = &[
    HEADER_TRACEPARENT,
    HEADER_TRACESTATE,
    HEADER_TASK_TYPE,
    HEADER_TASK_ID,
    HEADER_RETRY_COUNT,
    HEADER_MAX_RETRIES,
    HEADER_AI_PROCESSED,
    HEADER_ROUTING_REASON,
    HEADER_QUEUE_RECOMMENDATION,
    HEADER_AI_PRIORITY,
    HEADER_AI_DURATION_MS,
    HEADER_AI_IS_ANOMALY,
    HEADER_AI_SUCCESS_PROBABILITY,
    HEADER_AI_SERVICE_VERSION,
];

/// Build the header table for a publish.
///
/// The trace pair is injected separately by [`inject_current_context`] so
/// the headers reflect the publishing span, not the submitter's.
pub fn build_headers(task: &Task, decision: &RoutingDecision) -> FieldTable {
    let mut headers = FieldTable::default();
    insert_str(&mut headers, HEADER_TASK_TYPE, task.task_type.as_str());
    insert_str(&mut headers, HEADER_TASK_ID, &task.id);
    headers.insert(
        HEADER_RETRY_COUNT.into(),
        AMQPValue::LongLongInt(i64::from(task.retry_count)),
    );
    headers.insert(
        HEADER_MAX_RETRIES.into(),
        AMQPValue::LongLongInt(i64::from(task.max_retries)),
    );
    headers.insert(
        HEADER_AI_PROCESSED.into(),
        AMQPValue::Boolean(task.ai_processed),
    );
    insert_str(&mut headers, HEADER_ROUTING_REASON, &decision.reason);
    insert_str(
        &mut headers,
        HEADER_QUEUE_RECOMMENDATION,
        decision.destination.queue_name(),
    );

    if let Some(predictions) = &task.predictions {
        append_prediction_headers(&mut headers, predictions);
    }

    headers
}

fn append_prediction_headers(headers: &mut FieldTable, predictions: &TaskPredictions) {
    headers.insert(
        HEADER_AI_PRIORITY.into(),
        AMQPValue::Double(predictions.calculated_priority),
    );
    if let Some(duration) = predictions.predicted_duration_ms {
        headers.insert(HEADER_AI_DURATION_MS.into(), AMQPValue::Double(duration));
    }
    headers.insert(
        HEADER_AI_IS_ANOMALY.into(),
        AMQPValue::Boolean(predictions.is_anomaly),
    );
    headers.insert(
        HEADER_AI_SUCCESS_PROBABILITY.into(),
        AMQPValue::Double(predictions.success_probability),
    );
    insert_str(headers, HEADER_AI_SERVICE_VERSION, &predictions.model_version);
}

fn insert_str(headers: &mut FieldTable, key: &str, value: &str) {
    headers.insert(key.into(), AMQPValue::LongString(value.into()));
}

/// Injects the current tracing span's context as W3C headers.
struct FieldTableInjector<'a>(&'a mut FieldTable);

impl Injector for FieldTableInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0
            .insert(key.into(), AMQPValue::LongString(value.into()));
    }
}

/// Reads W3C headers back out of a delivery's header table.
struct FieldTableExtractor<'a>(&'a FieldTable);

impl Extractor for FieldTableExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        header_str(self.0, key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.inner().keys().map(|k| k.as_str()).collect()
    }
}

/// Inject the current span's W3C trace context into the header table.
pub fn inject_current_context(headers: &mut FieldTable) {
    let context = tracing::Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut FieldTableInjector(headers));
    });
}

/// Extract the publishing span's context from a delivery's headers.
pub fn extract_context(headers: &FieldTable) -> opentelemetry::Context {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&FieldTableExtractor(headers))
    })
}

fn header_str<'a>(headers: &'a FieldTable, key: &str) -> Option<&'a str> {
    headers.inner().get(key).and_then(|value| match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
        AMQPValue::ShortString(s) => Some(s.as_str()),
        _ => None,
    })
}

fn header_i64(headers: &FieldTable, key: &str) -> Option<i64> {
    headers.inner().get(key).and_then(|value| match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        _ => None,
    })
}

fn header_bool(headers: &FieldTable, key: &str) -> Option<bool> {
    headers.inner().get(key).and_then(|value| match value {
        AMQPValue::Boolean(v) => Some(*v),
        _ => None,
    })
}

/// Parsed view of the required and optional wire headers on a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeaders {
    pub task_id: String,
    pub task_type: String,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
    pub ai_processed: bool,
    pub routing_reason: Option<String>,
    pub queue_recommendation: Option<String>,
}

impl MessageHeaders {
    /// Parse a delivery's header table.
    ///
    /// `task-id`, `task-type`, and `retry-count` are required; a missing
    /// or malformed value is a parse failure for the delivery (terminal,
    /// no requeue).
    pub fn parse(headers: &FieldTable) -> Result<MessageHeaders, MessagingError> {
        let task_id = header_str(headers, HEADER_TASK_ID)
            .ok_or_else(|| MessagingError::malformed_header(HEADER_TASK_ID))?
            .to_string();
        let task_type = header_str(headers, HEADER_TASK_TYPE)
            .ok_or_else(|| MessagingError::malformed_header(HEADER_TASK_TYPE))?
            .to_string();
        let retry_count = header_i64(headers, HEADER_RETRY_COUNT)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| MessagingError::malformed_header(HEADER_RETRY_COUNT))?;
        let max_retries =
            header_i64(headers, HEADER_MAX_RETRIES).and_then(|v| u32::try_from(v).ok());
        let ai_processed = header_bool(headers, HEADER_AI_PROCESSED).unwrap_or(false);

        Ok(MessageHeaders {
            task_id,
            task_type,
            retry_count,
            max_retries,
            ai_processed,
            routing_reason: header_str(headers, HEADER_ROUTING_REASON).map(str::to_string),
            queue_recommendation: header_str(headers, HEADER_QUEUE_RECOMMENDATION)
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::TaskType;
    use crate::routing;
    use opentelemetry::trace::TraceContextExt;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    fn task_with_predictions() -> Task {
        let mut task = Task::new(TaskType::ReportGeneration, "header test", 3);
        task.attach_predictions(TaskPredictions {
            task_id: task.id.clone(),
            calculated_priority: 9.0,
            predicted_duration_ms: Some(45_000.0),
            success_probability: 0.95,
            recommended_destination: Some("critical".into()),
            model_version: "hybrid-2.4.1".into(),
            ..Default::default()
        });
        task
    }

    #[test]
    fn headers_stay_within_the_catalog() {
        let task = task_with_predictions();
        let decision = routing::route(&task, task.predictions.as_ref());
        let mut headers = build_headers(&task, &decision);
        inject_current_context(&mut headers);

        for key in headers.inner().keys() {
            assert!(
                HEADER_CATALOG.contains(&key.as_str()),
                "header {key} outside catalog"
            );
        }
        // Required trio always present.
        for required in [HEADER_TASK_ID, HEADER_TASK_TYPE, HEADER_RETRY_COUNT] {
            assert!(headers.inner().contains_key(required), "missing {required}");
        }
    }

    #[test]
    fn prediction_headers_appear_only_with_predictions() {
        let task = Task::new(TaskType::EmailNotification, "plain", 4);
        let decision = routing::route(&task, None);
        let headers = build_headers(&task, &decision);
        assert!(!headers.inner().contains_key(HEADER_AI_PRIORITY));
        assert!(!headers.inner().contains_key(HEADER_AI_SERVICE_VERSION));

        let task = task_with_predictions();
        let decision = routing::route(&task, task.predictions.as_ref());
        let headers = build_headers(&task, &decision);
        assert!(headers.inner().contains_key(HEADER_AI_PRIORITY));
        assert!(headers.inner().contains_key(HEADER_AI_IS_ANOMALY));
        assert_eq!(
            header_str(&headers, HEADER_AI_SERVICE_VERSION),
            Some("hybrid-2.4.1")
        );
    }

    #[test]
    fn parse_round_trips_required_fields() {
        let mut task = task_with_predictions();
        task.retry_count = 2;
        task.max_retries = 3;
        let decision = routing::route(&task, task.predictions.as_ref());
        let headers = build_headers(&task, &decision);

        let parsed = MessageHeaders::parse(&headers).unwrap();
        assert_eq!(parsed.task_id, task.id);
        assert_eq!(parsed.task_type, "ReportGeneration");
        assert_eq!(parsed.retry_count, 2);
        assert_eq!(parsed.max_retries, Some(3));
        assert!(parsed.ai_processed);
        assert_eq!(
            parsed.queue_recommendation.as_deref(),
            Some("critical-priority-queue")
        );
        assert!(parsed
            .routing_reason
            .unwrap()
            .starts_with("ai-optimized:"));
    }

    #[test]
    fn parse_rejects_missing_required_headers() {
        let headers = FieldTable::default();
        let err = MessageHeaders::parse(&headers).unwrap_err();
        assert_eq!(err, MessagingError::malformed_header(HEADER_TASK_ID));
    }

    #[test]
    fn trace_context_extracts_from_w3c_headers() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let mut headers = FieldTable::default();
        insert_str(
            &mut headers,
            HEADER_TRACEPARENT,
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        );
        let context = extract_context(&headers);
        let span_context = context.span().span_context().clone();
        assert!(span_context.is_valid());
        assert_eq!(
            span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
    }

    #[test]
    fn extract_without_headers_yields_invalid_context() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let context = extract_context(&FieldTable::default());
        assert!(!context.span().span_context().is_valid());
    }
}
