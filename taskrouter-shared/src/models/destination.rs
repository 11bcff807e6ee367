//! # Destination Catalog
//!
//! The closed set of broker destinations with their fixed wire properties
//! (exchange, routing key, max wire priority, TTL, depth cap) and the
//! per-destination consumer policy defaults (concurrency, prefetch, retry
//! budget, retry delay).
//!
//! Queue arguments mirror the broker topology: every priority queue carries
//! `x-max-priority`, `x-message-ttl`, `x-max-length`,
//! `x-overflow=reject-publish`, and dead-letters into `dlq-exchange` on
//! routing key `failed`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Topic exchange carrying the five priority routing keys.
pub const PRIORITY_EXCHANGE: &str = "priority-exchange";
/// Direct exchange for anomaly-flagged tasks.
pub const ANOMALY_EXCHANGE: &str = "anomaly-exchange";
/// Direct exchange receiving dead-lettered messages.
pub const DLQ_EXCHANGE: &str = "dlq-exchange";
/// Terminal sink for messages that exhaust retries or fail to parse.
pub const DLQ_QUEUE: &str = "dlq-queue";
/// Binding key between `dlq-exchange` and `dlq-queue`.
pub const DLQ_ROUTING_KEY: &str = "failed";

/// A named broker queue with fixed routing and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Critical,
    High,
    Normal,
    Low,
    Batch,
    Anomaly,
}

impl Destination {
    /// All destinations, in descending urgency order.
    pub const ALL: [Destination; 6] = [
        Destination::Critical,
        Destination::High,
        Destination::Normal,
        Destination::Low,
        Destination::Batch,
        Destination::Anomaly,
    ];

    /// Stable lowercase name used in metric labels and config sections.
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Critical => "critical",
            Destination::High => "high",
            Destination::Normal => "normal",
            Destination::Low => "low",
            Destination::Batch => "batch",
            Destination::Anomaly => "anomaly",
        }
    }

    /// Parse a destination name as produced by `as_str` or by the
    /// prediction service's `recommended_destination` field.
    ///
    /// Returns `None` for names outside the closed catalog; callers fall
    /// back to [`Destination::Normal`] with a validation note.
    pub fn parse(name: &str) -> Option<Destination> {
        match name.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Destination::Critical),
            "high" => Some(Destination::High),
            "normal" => Some(Destination::Normal),
            "low" => Some(Destination::Low),
            "batch" => Some(Destination::Batch),
            "anomaly" => Some(Destination::Anomaly),
            _ => None,
        }
    }

    /// Durable queue name on the broker.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Destination::Critical => "critical-priority-queue",
            Destination::High => "high-priority-queue",
            Destination::Normal => "normal-priority-queue",
            Destination::Low => "low-priority-queue",
            Destination::Batch => "batch-queue",
            Destination::Anomaly => "anomaly-queue",
        }
    }

    /// Fixed routing key binding the queue to its exchange.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Destination::Critical => "priority.critical",
            Destination::High => "priority.high",
            Destination::Normal => "priority.normal",
            Destination::Low => "priority.low",
            Destination::Batch => "priority.batch",
            Destination::Anomaly => "anomaly.detected",
        }
    }

    /// Exchange the destination is bound to.
    pub fn exchange(&self) -> &'static str {
        match self {
            Destination::Anomaly => ANOMALY_EXCHANGE,
            _ => PRIORITY_EXCHANGE,
        }
    }

    /// Maximum wire priority the queue accepts (`x-max-priority`).
    pub fn max_wire_priority(&self) -> u8 {
        match self {
            Destination::Critical => 255,
            Destination::High => 200,
            Destination::Normal => 100,
            Destination::Low => 50,
            Destination::Batch => 10,
            Destination::Anomaly => 150,
        }
    }

    /// Per-message TTL in milliseconds (`x-message-ttl`).
    pub fn message_ttl_ms(&self) -> u32 {
        match self {
            Destination::Critical => 60_000,
            Destination::High => 300_000,
            Destination::Normal => 600_000,
            Destination::Low => 1_800_000,
            Destination::Batch => 3_600_000,
            Destination::Anomaly => 300_000,
        }
    }

    /// Queue depth cap (`x-max-length`); overflow rejects the publish.
    pub fn max_depth(&self) -> u32 {
        match self {
            Destination::Critical => 1_000,
            Destination::High => 5_000,
            Destination::Normal => 10_000,
            Destination::Low => 20_000,
            Destination::Batch => 50_000,
            Destination::Anomaly => 2_000,
        }
    }

    /// Initial consumer policy for this destination.
    ///
    /// Values are starting points; the `[consumer.<destination>]` config
    /// section overrides them.
    pub fn default_policy(&self) -> ConsumerPolicy {
        match self {
            Destination::Critical => ConsumerPolicy::new(5, 1, 2, Duration::from_secs(1)),
            Destination::High => ConsumerPolicy::new(3, 2, 3, Duration::from_secs(2)),
            Destination::Normal => ConsumerPolicy::new(2, 5, 3, Duration::from_secs(5)),
            Destination::Low => ConsumerPolicy::new(1, 10, 3, Duration::from_secs(5)),
            Destination::Batch => ConsumerPolicy::new(1, 20, 5, Duration::from_secs(10)),
            Destination::Anomaly => ConsumerPolicy::new(2, 1, 1, Duration::from_secs(5)),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-destination consumer discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerPolicy {
    /// Parallel handler invocations allowed at once.
    pub concurrency: usize,
    /// AMQP prefetch (`basic_qos`) for the destination's channel.
    pub prefetch: u16,
    /// Retry budget; handler invocations per task are at most `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before a requeued delivery, interruptible by shutdown.
    pub retry_delay: Duration,
}

impl ConsumerPolicy {
    pub fn new(concurrency: usize, prefetch: u16, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            concurrency,
            prefetch,
            max_retries,
            retry_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_closed_and_parse_round_trips() {
        for dest in Destination::ALL {
            assert_eq!(Destination::parse(dest.as_str()), Some(dest));
        }
        assert_eq!(Destination::parse("express"), None);
        assert_eq!(Destination::parse(""), None);
    }

    #[test]
    fn parse_tolerates_case_and_whitespace() {
        assert_eq!(Destination::parse(" Critical "), Some(Destination::Critical));
        assert_eq!(Destination::parse("BATCH"), Some(Destination::Batch));
    }

    #[test]
    fn anomaly_binds_to_its_own_exchange() {
        assert_eq!(Destination::Anomaly.exchange(), ANOMALY_EXCHANGE);
        assert_eq!(Destination::Anomaly.routing_key(), "anomaly.detected");
        for dest in [
            Destination::Critical,
            Destination::High,
            Destination::Normal,
            Destination::Low,
            Destination::Batch,
        ] {
            assert_eq!(dest.exchange(), PRIORITY_EXCHANGE);
            assert!(dest.routing_key().starts_with("priority."));
        }
    }

    #[test]
    fn wire_properties_match_broker_topology() {
        assert_eq!(Destination::Critical.max_wire_priority(), 255);
        assert_eq!(Destination::Critical.message_ttl_ms(), 60_000);
        assert_eq!(Destination::Batch.max_depth(), 50_000);
        assert_eq!(Destination::Anomaly.max_wire_priority(), 150);
    }

    #[test]
    fn default_policies_match_initial_table() {
        let critical = Destination::Critical.default_policy();
        assert_eq!(critical.concurrency, 5);
        assert_eq!(critical.prefetch, 1);
        assert_eq!(critical.max_retries, 2);
        assert_eq!(critical.retry_delay, Duration::from_secs(1));

        let batch = Destination::Batch.default_policy();
        assert_eq!(batch.max_retries, 5);
        assert_eq!(batch.retry_delay, Duration::from_secs(10));

        let anomaly = Destination::Anomaly.default_policy();
        assert_eq!(anomaly.max_retries, 1);
        assert_eq!(anomaly.prefetch, 1);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Destination::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: Destination = serde_json::from_str("\"anomaly\"").unwrap();
        assert_eq!(back, Destination::Anomaly);
    }
}
