//! Tracer provider, propagator and log subscriber setup.
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::EnvFilter;

use crate::config::{ExporterKind, TelemetryArgs};

/// Install the global propagator, tracer provider and log subscriber.
///
/// `default_service_name` is used when no service name is configured. The
/// returned provider must be shut down before exit to flush pending spans.
pub fn init(args: &TelemetryArgs, default_service_name: &'static str) -> Result<SdkTracerProvider> {
    init_logs()?;

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    let service_name = args
        .service_name
        .clone()
        .unwrap_or_else(|| default_service_name.to_string());
    let builder = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name).build());

    let provider = match args.exporter {
        ExporterKind::Otlp => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(args.otlp_endpoint.clone())
                .build()?;
            builder.with_batch_exporter(exporter).build()
        }
        ExporterKind::Stdout => builder
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build(),
        ExporterKind::None => builder.build(),
    };

    global::set_tracer_provider(provider.clone());
    tracing::info!(
        exporter = ?args.exporter,
        endpoint = %args.otlp_endpoint,
        "tracer provider installed"
    );
    Ok(provider)
}

fn init_logs() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Flush and shut down the tracer provider.
pub fn shutdown(provider: SdkTracerProvider) -> Result<()> {
    provider
        .shutdown()
        .map_err(|err| anyhow!("failed to shut down tracer provider: {err}"))
}
