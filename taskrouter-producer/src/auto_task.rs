//! # AutoTask Supervisor
//!
//! Supervised demo-task generator. Owns its loop state explicitly: a
//! shutdown watch channel, a completion channel, and atomic counters. The
//! web surface holds a handle and drives start/stop; starting twice is a
//! guarded no-op, not a second loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tracing::{info, warn};

use taskrouter_shared::errors::{TaskRouterError, TaskRouterResult};
use taskrouter_shared::models::features::{BusinessPriority, TaskFeatures, UserTier};
use taskrouter_shared::models::task::{Task, TaskType};

use crate::publisher::TaskPublisher;

/// Handle to a running generator loop.
struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    completion_rx: oneshot::Receiver<u64>,
}

/// Counters exposed on the status endpoint.
#[derive(Debug, Default)]
pub struct AutoTaskCounters {
    pub generated: AtomicU64,
    pub publish_failures: AtomicU64,
}

/// Supervisor over the demo-task generation loop.
pub struct AutoTaskSupervisor {
    publisher: Arc<TaskPublisher>,
    interval: Duration,
    running: AtomicBool,
    counters: Arc<AutoTaskCounters>,
    current: Mutex<Option<RunningLoop>>,
}

impl AutoTaskSupervisor {
    pub fn new(publisher: Arc<TaskPublisher>, interval: Duration) -> Self {
        Self {
            publisher,
            interval,
            running: AtomicBool::new(false),
            counters: Arc::new(AutoTaskCounters::default()),
            current: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> &AutoTaskCounters {
        &self.counters
    }

    /// Start the generator loop. No-op when already running.
    pub async fn start(&self) -> TaskRouterResult<()> {
        let mut current = self.current.lock().await;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (completion_tx, completion_rx) = oneshot::channel();

        let publisher = self.publisher.clone();
        let counters = self.counters.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let sent = run_loop(publisher, counters, interval, shutdown_rx).await;
            let _ = completion_tx.send(sent);
        });

        *current = Some(RunningLoop {
            shutdown_tx,
            completion_rx,
        });
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "AutoTask generator started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for the loop to finish its current tick.
    /// Returns the number of tasks the loop published.
    pub async fn stop(&self) -> TaskRouterResult<u64> {
        let mut current = self.current.lock().await;
        let Some(running) = current.take() else {
            return Err(TaskRouterError::InvalidState(
                "auto-task generator is not running".to_string(),
            ));
        };

        let _ = running.shutdown_tx.send(true);
        let sent = running.completion_rx.await.unwrap_or(0);
        self.running.store(false, Ordering::Release);
        info!(tasks_generated = sent, "AutoTask generator stopped");
        Ok(sent)
    }
}

async fn run_loop(
    publisher: Arc<TaskPublisher>,
    counters: Arc<AutoTaskCounters>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sent_this_run = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sequence = counters.generated.fetch_add(1, Ordering::Relaxed);
                let mut task = generate_demo_task(sequence);
                match publisher.publish(&mut task).await {
                    Ok(decision) => {
                        sent_this_run += 1;
                        tracing::debug!(
                            task_id = %task.id,
                            destination = %decision.destination,
                            "AutoTask published"
                        );
                    }
                    Err(e) => {
                        counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "AutoTask publish failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    sent_this_run
}

/// Deterministic rotation over the task-type catalog and priority range.
fn generate_demo_task(sequence: u64) -> Task {
    let task_type = TaskType::ALL[(sequence as usize) % TaskType::ALL.len()];
    let manual_priority = (sequence % 11) as u8;

    let mut features = TaskFeatures::default();
    features.user.tier = Some(match sequence % 3 {
        0 => UserTier::Free,
        1 => UserTier::Premium,
        _ => UserTier::Enterprise,
    });
    features.business.business_priority = Some(match manual_priority {
        8.. => BusinessPriority::Critical,
        5.. => BusinessPriority::High,
        2.. => BusinessPriority::Normal,
        _ => BusinessPriority::Low,
    });
    features.business.source = Some("auto-task".to_string());

    Task::new(
        task_type,
        format!("auto {task_type} #{sequence}"),
        manual_priority,
    )
    .with_description("generated by the auto-task loop")
    .with_features(features)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_tasks_rotate_types_and_priorities() {
        let first = generate_demo_task(0);
        let second = generate_demo_task(1);
        assert_ne!(first.task_type, second.task_type);
        assert_eq!(generate_demo_task(11).manual_priority, 0);
        assert_eq!(generate_demo_task(10).manual_priority, 10);

        // Same sequence number, same shape: the rotation is deterministic.
        let again = generate_demo_task(1);
        assert_eq!(again.task_type, second.task_type);
        assert_eq!(again.manual_priority, second.manual_priority);
        assert_eq!(again.features, second.features);
    }

    #[test]
    fn demo_tasks_carry_source_feature() {
        let task = generate_demo_task(7);
        let features = task.features.expect("features present");
        assert_eq!(features.business.source.as_deref(), Some("auto-task"));
        assert!(features.user.tier.is_some());
    }
}
