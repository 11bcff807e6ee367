//! # Task Handlers
//!
//! The handler trait, the per-type registry, and the destination-specific
//! invocation wrappers. Handlers only ever see the typed parameter
//! projection; the raw wire map stays at the boundary.
//!
//! Wrappers add logging and policy annotations per destination (critical:
//! low-latency path, anomaly: extra diagnostics, batch: long executions
//! expected). They never change the retry contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use taskrouter_shared::errors::{TaskRouterError, TaskRouterResult};
use taskrouter_shared::models::destination::Destination;
use taskrouter_shared::models::parameters::TypedParameters;
use taskrouter_shared::models::task::{Task, TaskType};

/// Latency annotation threshold for the critical path.
const CRITICAL_LATENCY_BUDGET_MS: u128 = 1_000;

/// Business logic for one task type.
///
/// Handlers are invoked at-least-once and must be idempotent. Long
/// computations should yield at await points so the worker's shutdown
/// signal can cancel them between steps.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, parameters: &TypedParameters) -> TaskRouterResult<()>;
}

/// Maps task types to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the demo handler bound to every task type.
    pub fn with_demo_handlers() -> Self {
        let mut registry = Self::new();
        let demo: Arc<dyn TaskHandler> = Arc::new(DemoTaskHandler);
        for task_type in TaskType::ALL {
            registry.register(task_type, demo.clone());
        }
        registry
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn resolve(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.keys().copied().collect()
    }
}

/// Invoke a task's handler through its destination wrapper.
///
/// Projects the wire parameters to the typed view first; a projection
/// failure is a handler failure, subject to the normal retry budget.
pub async fn invoke(
    destination: Destination,
    registry: &HandlerRegistry,
    task: &Task,
) -> TaskRouterResult<()> {
    let handler = registry.resolve(task.task_type).ok_or_else(|| {
        TaskRouterError::Handler(format!("no handler registered for {}", task.task_type))
    })?;
    let parameters = TypedParameters::project(task.task_type, &task.parameters)
        .map_err(|e| TaskRouterError::Handler(e.to_string()))?;

    match destination {
        Destination::Critical => {
            let started = Instant::now();
            let result = handler.handle(task, &parameters).await;
            let elapsed = started.elapsed().as_millis();
            if elapsed > CRITICAL_LATENCY_BUDGET_MS {
                warn!(
                    task_id = %task.id,
                    elapsed_ms = elapsed as u64,
                    "Critical-path handler exceeded its latency budget"
                );
            }
            result
        }
        Destination::Anomaly => {
            let populated = task
                .features
                .as_ref()
                .map(|f| f.populated_field_count())
                .unwrap_or(0);
            let anomaly_tags = task
                .predictions
                .as_ref()
                .map(|p| p.anomaly_tags.clone())
                .unwrap_or_default();
            info!(
                task_id = %task.id,
                task_type = %task.task_type,
                populated_features = populated,
                anomaly_tags = ?anomaly_tags,
                "Processing anomaly-flagged task"
            );
            let result = handler.handle(task, &parameters).await;
            match &result {
                Ok(()) => info!(task_id = %task.id, "Anomaly task completed"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Anomaly task failed"),
            }
            result
        }
        Destination::Batch => {
            debug!(task_id = %task.id, "Batch execution; long runtime permitted");
            handler.handle(task, &parameters).await
        }
        _ => handler.handle(task, &parameters).await,
    }
}

/// Default handler used by the demo deployment and the integration tests.
///
/// Fails when the task carries a truthy `simulate_failure` parameter,
/// which is how the retry-exhaustion path is exercised end to end.
pub struct DemoTaskHandler;

#[async_trait]
impl TaskHandler for DemoTaskHandler {
    async fn handle(&self, task: &Task, parameters: &TypedParameters) -> TaskRouterResult<()> {
        if task
            .parameters
            .get("simulate_failure")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(TaskRouterError::Handler(format!(
                "simulated failure for task {}",
                task.id
            )));
        }

        match parameters {
            TypedParameters::EmailNotification(email) => {
                debug!(task_id = %task.id, recipient = %email.recipient, "Demo email handled");
            }
            TypedParameters::ReportGeneration(report) => {
                debug!(task_id = %task.id, kind = %report.report_kind, "Demo report handled");
            }
            _ => {
                debug!(task_id = %task.id, task_type = %task.task_type, "Demo task handled");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_handler_succeeds_on_plain_tasks() {
        let registry = HandlerRegistry::with_demo_handlers();
        let task = Task::new(TaskType::EmailNotification, "mail", 4);
        let result = invoke(Destination::Normal, &registry, &task).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn demo_handler_fails_on_simulated_failure() {
        let registry = HandlerRegistry::with_demo_handlers();
        let task = Task::new(TaskType::DataProcessing, "crunch", 5)
            .with_parameter("simulate_failure", serde_json::json!(true));
        let err = invoke(Destination::High, &registry, &task).await.unwrap_err();
        assert!(err.to_string().contains("simulated failure"));
    }

    #[tokio::test]
    async fn missing_handler_is_a_handler_failure() {
        let registry = HandlerRegistry::new();
        let task = Task::new(TaskType::DataBackup, "backup", 1);
        let err = invoke(Destination::Low, &registry, &task).await.unwrap_err();
        assert!(matches!(err, TaskRouterError::Handler(_)));
    }

    #[tokio::test]
    async fn projection_failure_is_a_handler_failure() {
        let registry = HandlerRegistry::with_demo_handlers();
        let task = Task::new(TaskType::ReportGeneration, "report", 5)
            .with_parameter("period_days", serde_json::json!("not a number"));
        let err = invoke(Destination::Normal, &registry, &task).await.unwrap_err();
        assert!(matches!(err, TaskRouterError::Handler(_)));
    }

    #[tokio::test]
    async fn wrappers_do_not_change_the_outcome() {
        let registry = HandlerRegistry::with_demo_handlers();
        let task = Task::new(TaskType::ImageProcessing, "resize", 6);
        for destination in Destination::ALL {
            assert!(
                invoke(destination, &registry, &task).await.is_ok(),
                "wrapper for {destination} altered the result"
            );
        }
    }
}
