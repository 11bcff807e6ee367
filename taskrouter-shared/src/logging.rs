//! # Logging & Telemetry Bootstrap
//!
//! Environment-aware console logging via the tracing ecosystem, with
//! optional OpenTelemetry span export over OTLP. Designed for
//! containerized processes: logs go to stdout, traces to the collector.
//!
//! The W3C `TraceContextPropagator` is registered globally even when span
//! export is disabled, because the broker hop always carries
//! `traceparent`/`tracestate` headers and consumers always attempt
//! extraction.
//!
//! Initialization is idempotent behind a `OnceLock`; the tracer provider
//! handle is retained so shutdown can flush pending spans.

use std::io::IsTerminal;
use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::TelemetryConfig;

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();
/// Retained for span flushing at shutdown.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lapin=warn".to_string())
}

fn build_tracer_provider(
    config: &TelemetryConfig,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error>> {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes([KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let sampler = if config.sample_rate >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sample_rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sample_rate)
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .with_sampler(sampler)
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    Ok(provider)
}

/// Initialize console logging and, when enabled, OTLP span export.
///
/// Must run inside a Tokio runtime when telemetry is enabled (the batch
/// exporter needs async I/O). Safe to call more than once.
pub fn init_tracing(config: &TelemetryConfig) {
    let config = config.clone();
    TRACING_INITIALIZED.get_or_init(move || {
        // Propagation is always on; export is opt-in.
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let use_ansi = IsTerminal::is_terminal(&std::io::stdout());
        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(use_ansi)
            .with_filter(EnvFilter::new(default_log_level()));

        let subscriber = tracing_subscriber::registry().with(console_layer);

        if config.enabled {
            match build_tracer_provider(&config) {
                Ok(provider) => {
                    let tracer = provider.tracer("taskrouter");
                    let subscriber = subscriber.with(OpenTelemetryLayer::new(tracer));
                    if subscriber.try_init().is_ok() {
                        tracing::info!(
                            otlp_endpoint = %config.otlp_endpoint,
                            service_name = %config.service_name,
                            "Tracing initialized with OpenTelemetry export"
                        );
                    }
                }
                Err(e) => {
                    if subscriber.try_init().is_ok() {
                        tracing::warn!(
                            error = %e,
                            "OTLP exporter setup failed; console logging only"
                        );
                    }
                }
            }
        } else if subscriber.try_init().is_ok() {
            tracing::info!(ansi_colors = use_ansi, "Console logging initialized");
        }
    });
}

/// Flush and shut down the tracer provider, if one was started.
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = TelemetryConfig::default();
        init_tracing(&config);
        init_tracing(&config);
        // Second call is a no-op; reaching here without a panic is the test.
    }
}
