//! # Messaging Error Types
//!
//! Structured error handling for the broker path using thiserror instead
//! of `Box<dyn Error>` patterns. Constructor helpers keep call sites to a
//! single line.

use thiserror::Error;

/// Errors on the broker path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Topology declaration failed: {entity}: {message}")]
    Topology { entity: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Publish to {routing_key} was rejected by the broker (queue at capacity or unroutable)")]
    PublishRejected { routing_key: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Message deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Required header missing or malformed: {header}")]
    MalformedHeader { header: String },

    #[error("Consume error on {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Acknowledgement failed: {operation} on delivery {delivery_tag}: {message}")]
    Acknowledge {
        operation: String,
        delivery_tag: u64,
        message: String,
    },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn topology(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn send(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::queue_operation(queue_name, "send", message)
    }

    pub fn publish_rejected(routing_key: impl Into<String>) -> Self {
        Self::PublishRejected {
            routing_key: routing_key.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    pub fn malformed_header(header: impl Into<String>) -> Self {
        Self::MalformedHeader {
            header: header.into(),
        }
    }

    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn ack(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledge {
            operation: "ack".into(),
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn nack(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledge {
            operation: "nack".into(),
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is the broker's overflow rejection, which the
    /// publisher surfaces to the submitter distinctly from transport
    /// failures.
    pub fn is_overflow(&self) -> bool {
        matches!(self, MessagingError::PublishRejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_helpers_build_structured_variants() {
        let err = MessagingError::send("batch-queue", "connection reset");
        assert_eq!(
            err,
            MessagingError::QueueOperation {
                queue_name: "batch-queue".into(),
                operation: "send".into(),
                message: "connection reset".into(),
            }
        );
    }

    #[test]
    fn overflow_is_distinguishable() {
        assert!(MessagingError::publish_rejected("priority.batch").is_overflow());
        assert!(!MessagingError::connection("refused").is_overflow());
    }
}
