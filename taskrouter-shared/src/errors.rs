//! Error types for the taskrouter system.

use thiserror::Error;

use crate::messaging::MessagingError;

/// Top-level error umbrella shared across the workspace.
///
/// Domain modules carry their own structured errors (`MessagingError` and
/// the producer's prediction errors); this enum exists so role crates can
/// return a single error type from composition points like bootstrap and
/// web handlers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskRouterError {
    #[error("Messaging error: {0}")]
    Messaging(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Prediction error: {0}")]
    Prediction(String),
    #[error("Handler error: {0}")]
    Handler(String),
    #[error("Web error: {0}")]
    Web(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MessagingError> for TaskRouterError {
    fn from(error: MessagingError) -> Self {
        TaskRouterError::Messaging(error.to_string())
    }
}

impl From<serde_json::Error> for TaskRouterError {
    fn from(error: serde_json::Error) -> Self {
        TaskRouterError::Validation(format!("JSON serialization error: {error}"))
    }
}

impl From<prometheus::Error> for TaskRouterError {
    fn from(error: prometheus::Error) -> Self {
        TaskRouterError::Internal(format!("Metrics registry error: {error}"))
    }
}

pub type TaskRouterResult<T> = Result<T, TaskRouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messaging_error_converts_to_umbrella() {
        let err = MessagingError::send("critical-priority-queue", "channel closed");
        let umbrella: TaskRouterError = err.into();
        assert!(matches!(umbrella, TaskRouterError::Messaging(_)));
        assert!(umbrella.to_string().contains("critical-priority-queue"));
    }
}
