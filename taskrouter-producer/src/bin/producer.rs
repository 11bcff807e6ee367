//! Producer service binary: broker topology, prediction client, publisher,
//! auto-task supervisor, and the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tracing::info;

use taskrouter_producer::auto_task::AutoTaskSupervisor;
use taskrouter_producer::prediction::PredictionClient;
use taskrouter_producer::publisher::TaskPublisher;
use taskrouter_producer::web::{create_producer_api, ApiState};
use taskrouter_shared::config::TaskRouterConfig;
use taskrouter_shared::logging;
use taskrouter_shared::messaging::RabbitBroker;
use taskrouter_shared::metrics::{PredictionMetrics, ProducerMetrics};

#[derive(Parser, Debug)]
#[command(name = "producer", about = "taskrouter producer service")]
struct Args {
    /// Path to a TOML config file; environment-only when omitted.
    #[arg(long, env = "TASKROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port from config.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config =
        TaskRouterConfig::resolve(args.config.as_deref()).context("configuration load failed")?;
    if let Some(port) = args.port {
        config.application.listen_port = port;
    }

    logging::init_tracing(&config.telemetry);

    let registry = Arc::new(Registry::new());
    let producer_metrics = ProducerMetrics::with_registry(registry.clone())?;
    let prediction_metrics = PredictionMetrics::with_registry(registry.clone())?;

    let broker = Arc::new(
        RabbitBroker::connect(&config.broker)
            .await
            .context("broker connection failed")?,
    );
    broker
        .declare_topology()
        .await
        .context("topology declaration failed")?;

    let prediction = Arc::new(PredictionClient::new(
        config.prediction.clone(),
        prediction_metrics,
    )?);
    let publisher = Arc::new(TaskPublisher::new(
        broker.clone(),
        prediction.clone(),
        producer_metrics,
    ));

    let supervisor = Arc::new(AutoTaskSupervisor::new(
        publisher.clone(),
        Duration::from_millis(config.application.auto_send_interval_ms),
    ));
    if config.application.auto_send_enabled {
        supervisor.start().await?;
    }

    let state = ApiState {
        broker: broker.clone(),
        publisher,
        supervisor: supervisor.clone(),
        registry,
    };
    let app = create_producer_api(state);

    let addr = format!("0.0.0.0:{}", config.application.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(listen = %addr, "Producer service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    if supervisor.is_running() {
        let _ = supervisor.stop().await;
    }
    broker.close().await.ok();
    logging::shutdown_telemetry();
    Ok(())
}
