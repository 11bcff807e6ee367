//! Consumer service binary: topology, the six-destination consumer pool,
//! training feedback, and the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tracing::info;

use taskrouter_consumer::handlers::HandlerRegistry;
use taskrouter_consumer::pool::ConsumerPool;
use taskrouter_consumer::web::{create_consumer_api, ApiState};
use taskrouter_shared::config::TaskRouterConfig;
use taskrouter_shared::logging;
use taskrouter_shared::messaging::RabbitBroker;
use taskrouter_shared::metrics::ConsumerMetrics;

#[derive(Parser, Debug)]
#[command(name = "consumer", about = "taskrouter consumer service")]
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
    let metrics = ConsumerMetrics::with_registry(registry.clone())?;

    let broker = Arc::new(
        RabbitBroker::connect(&config.broker)
            .await
            .context("broker connection failed")?,
    );

    let handlers = Arc::new(HandlerRegistry::with_demo_handlers());
    let pool = Arc::new(
        ConsumerPool::start(broker.clone(), &config, handlers, metrics)
            .await
            .context("consumer pool startup failed")?,
    );

    let state = ApiState {
        broker: broker.clone(),
        pool: pool.clone(),
        registry,
    };
    let app = create_consumer_api(state);

    let addr = format!("0.0.0.0:{}", config.application.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(listen = %addr, "Consumer service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown().await,
        Err(pool) => {
            // The web state still holds a clone; signal and let workers
            // stop without the full join.
            pool.signal_shutdown();
        }
    }
    broker.close().await.ok();
    logging::shutdown_telemetry();
    Ok(())
}
