//! # Consumer Pool
//!
//! Spawns one [`DestinationConsumer`] per destination, each on its own
//! channel with its own policy, plus the periodic introspection loop. The
//! pool owns the shutdown signal: workers observe it between deliveries,
//! inside retry delays, and across handler invocations.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskrouter_shared::config::TaskRouterConfig;
use taskrouter_shared::errors::TaskRouterResult;
use taskrouter_shared::messaging::{MessagingError, RabbitBroker};
use taskrouter_shared::metrics::ConsumerMetrics;
use taskrouter_shared::models::destination::Destination;

use crate::handlers::HandlerRegistry;
use crate::training::TrainingReporter;
use crate::worker::{DestinationConsumer, DestinationStats};

/// How often the pool logs per-destination throughput.
const INTROSPECTION_INTERVAL: Duration = Duration::from_secs(10);

/// The running pool; shut down via [`ConsumerPool::shutdown`].
pub struct ConsumerPool {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<(), MessagingError>>>,
    introspection: JoinHandle<()>,
    training: TrainingReporter,
    training_handle: JoinHandle<()>,
    stats: HashMap<Destination, Arc<DestinationStats>>,
}

impl ConsumerPool {
    /// Declare topology and start one consumer per destination.
    pub async fn start(
        broker: Arc<RabbitBroker>,
        config: &TaskRouterConfig,
        registry: Arc<HandlerRegistry>,
        metrics: ConsumerMetrics,
    ) -> TaskRouterResult<Self> {
        broker.declare_topology().await?;

        let (training, training_handle) = TrainingReporter::spawn(
            &config.prediction,
            metrics.clone(),
            config.consumer.report_dead_lettered,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(Destination::ALL.len());
        let mut stats = HashMap::new();
        for destination in Destination::ALL {
            let policy = config.consumer.policy_for(destination);
            let channel = broker.create_channel().await?;
            let destination_stats = Arc::new(DestinationStats::default());
            stats.insert(destination, destination_stats.clone());

            let consumer = DestinationConsumer::new(
                destination,
                policy,
                channel,
                registry.clone(),
                metrics.clone(),
                training.clone(),
                destination_stats,
                config.consumer.jitter_enabled,
                config.consumer.max_jitter,
                shutdown_rx.clone(),
            );
            workers.push(tokio::spawn(consumer.run()));
        }

        let introspection = tokio::spawn(introspection_loop(stats.clone(), shutdown_rx));
        info!(destinations = Destination::ALL.len(), "Consumer pool started");

        Ok(Self {
            shutdown_tx,
            workers,
            introspection,
            training,
            training_handle,
            stats,
        })
    }

    pub fn stats_for(&self, destination: Destination) -> Option<&Arc<DestinationStats>> {
        self.stats.get(&destination)
    }

    pub fn stats_snapshot(&self) -> HashMap<Destination, (u64, u64, u64)> {
        self.stats
            .iter()
            .map(|(dest, stats)| {
                (
                    *dest,
                    (
                        stats.acked.load(Ordering::Relaxed),
                        stats.requeued.load(Ordering::Relaxed),
                        stats.dead_lettered.load(Ordering::Relaxed),
                    ),
                )
            })
            .collect()
    }

    /// Signal shutdown without waiting. [`ConsumerPool::shutdown`] is the
    /// complete path; this exists for callers that cannot take ownership.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Graceful shutdown: signal, wait for workers to drain in-flight
    /// handlers, then stop the auxiliary loops.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for worker in self.workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Consumer exited with error"),
                Err(e) => warn!(error = %e, "Consumer task panicked"),
            }
        }
        self.introspection.abort();

        // Close the report queue, then give the drain task a moment to
        // flush what it already holds.
        drop(self.training);
        if tokio::time::timeout(Duration::from_secs(5), self.training_handle)
            .await
            .is_err()
        {
            warn!("Training reporter did not drain within the shutdown grace period");
        }
        info!("Consumer pool stopped");
    }
}

/// Per-destination throughput and rolling-average latency, every 10 s.
///
/// This is also the seam for dynamic concurrency adjustment: queue-depth
/// readings would be compared against throughput here and the per-worker
/// semaphore resized.
async fn introspection_loop(
    stats: HashMap<Destination, Arc<DestinationStats>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut previous: HashMap<Destination, (u64, u64)> = HashMap::new();
    let mut ticker = tokio::time::interval(INTROSPECTION_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (destination, destination_stats) in &stats {
                    let handled = destination_stats.acked.load(Ordering::Relaxed)
                        + destination_stats.requeued.load(Ordering::Relaxed)
                        + destination_stats.dead_lettered.load(Ordering::Relaxed);
                    let latency_total =
                        destination_stats.handler_latency_ms_total.load(Ordering::Relaxed);

                    let (prev_handled, prev_latency) =
                        previous.get(destination).copied().unwrap_or((0, 0));
                    let delta_handled = handled.saturating_sub(prev_handled);
                    let delta_latency = latency_total.saturating_sub(prev_latency);
                    previous.insert(*destination, (handled, latency_total));

                    if delta_handled == 0 {
                        continue;
                    }
                    let avg_latency_ms = delta_latency as f64 / delta_handled as f64;
                    let throughput = delta_handled as f64
                        / INTROSPECTION_INTERVAL.as_secs_f64();
                    info!(
                        destination = %destination,
                        throughput_per_s = throughput,
                        avg_latency_ms = avg_latency_ms,
                        "Destination throughput"
                    );
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
