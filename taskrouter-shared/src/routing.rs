//! # Routing Engine
//!
//! Pure, deterministic mapping from `(task, predictions | none)` to a
//! routing decision: destination, exchange, routing key, wire priority,
//! TTL, and a human-readable reason. No I/O, no shared state; equal inputs
//! yield equal outputs across runs and processes.
//!
//! Decision order:
//!
//! 1. Predictions with a `recommended_destination`: validate it against the
//!    closed catalog. Unknown names route to `normal` and carry a
//!    validation note.
//! 2. Predictions without a recommendation: the flag table. The anomaly
//!    flag forces `anomaly`; batch-suitability forces `batch`; otherwise
//!    the manual-priority thresholds decide.
//! 3. No predictions at all: the manual-priority thresholds alone, with a
//!    `"fallback:"` reason. Neither flag can fire because both derive from
//!    prediction outputs.

use serde::{Deserialize, Serialize};

use crate::models::destination::Destination;
use crate::models::predictions::{effective_priority, TaskPredictions};
use crate::models::task::Task;

/// Predicted duration above which a task is a candidate for the batch queue.
const BATCH_DURATION_THRESHOLD_MS: f64 = 30_000.0;
/// Effective priority at or below which a task is a candidate for batch.
const BATCH_PRIORITY_CEILING: u8 = 2;

/// Scale from the human 0-10 priority scale to the 0-255 wire scale.
const WIRE_PRIORITY_SCALE: f64 = 25.5;

/// Outcome of the routing engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub destination: Destination,
    pub exchange: String,
    pub routing_key: String,
    /// Message priority on the 0-255 wire scale, never above the
    /// destination's `x-max-priority`.
    pub wire_priority: u8,
    /// Per-message expiration, from the destination table.
    pub ttl_ms: u32,
    pub reason: String,
    /// Set when the recommended destination failed catalog validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_note: Option<String>,
}

/// Decide routing for a task.
///
/// `predictions` is passed explicitly rather than read from the task so
/// the function stays a pure mapping over its visible inputs; the
/// publisher passes `task.predictions.as_ref()`.
pub fn route(task: &Task, predictions: Option<&TaskPredictions>) -> RoutingDecision {
    match predictions {
        Some(p) => route_with_predictions(task, p),
        None => {
            let destination = destination_for_manual_priority(task.manual_priority);
            decision(
                task,
                destination,
                f64::from(task.manual_priority),
                "fallback: predictions unavailable".to_string(),
                None,
            )
        }
    }
}

fn route_with_predictions(task: &Task, predictions: &TaskPredictions) -> RoutingDecision {
    let reason = format!("ai-optimized: {}", priority_reason(predictions));

    if let Some(recommended) = predictions.recommended_destination.as_deref() {
        return match Destination::parse(recommended) {
            Some(destination) => decision(
                task,
                destination,
                predictions.calculated_priority,
                reason,
                None,
            ),
            None => decision(
                task,
                Destination::Normal,
                predictions.calculated_priority,
                reason,
                Some(format!(
                    "recommended destination {recommended:?} not in catalog; routed to normal"
                )),
            ),
        };
    }

    // No recommendation requested or returned: the flag table decides.
    let destination = if predictions.is_anomaly {
        Destination::Anomaly
    } else if is_batch_suitable(
        effective_priority(task.manual_priority, Some(predictions)),
        predictions.predicted_duration_ms,
        task.features
            .as_ref()
            .and_then(|f| f.business.is_scheduled),
    ) {
        Destination::Batch
    } else {
        destination_for_manual_priority(task.manual_priority)
    };

    decision(task, destination, predictions.calculated_priority, reason, None)
}

fn priority_reason(predictions: &TaskPredictions) -> &str {
    if predictions.priority_reason.is_empty() {
        "model priority"
    } else {
        &predictions.priority_reason
    }
}

/// Manual-priority threshold table used whenever no valid recommendation
/// exists.
fn destination_for_manual_priority(priority: u8) -> Destination {
    match priority {
        8.. => Destination::Critical,
        5.. => Destination::High,
        2.. => Destination::Normal,
        _ => Destination::Low,
    }
}

/// A task is batch-suitable iff all three hold: effective priority at most
/// 2, predicted duration above 30 s, and the scheduled flag not explicitly
/// false.
pub fn is_batch_suitable(
    effective_priority: u8,
    predicted_duration_ms: Option<f64>,
    is_scheduled: Option<bool>,
) -> bool {
    effective_priority <= BATCH_PRIORITY_CEILING
        && predicted_duration_ms.is_some_and(|d| d > BATCH_DURATION_THRESHOLD_MS)
        && is_scheduled != Some(false)
}

/// Scale a 0-10 priority to the wire range and clamp to what the
/// destination's queue accepts.
fn wire_priority_for(destination: Destination, priority: f64) -> u8 {
    let scaled = (priority * WIRE_PRIORITY_SCALE).round().clamp(0.0, 255.0) as u8;
    scaled.min(destination.max_wire_priority())
}

fn decision(
    task: &Task,
    destination: Destination,
    priority: f64,
    reason: String,
    validation_note: Option<String>,
) -> RoutingDecision {
    let routing_key = task
        .routing_key
        .clone()
        .unwrap_or_else(|| destination.routing_key().to_string());
    RoutingDecision {
        destination,
        exchange: destination.exchange().to_string(),
        routing_key,
        wire_priority: wire_priority_for(destination, priority),
        ttl_ms: destination.message_ttl_ms(),
        reason,
        validation_note,
    }
}
