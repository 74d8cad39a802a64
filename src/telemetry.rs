//! Log subscriber setup with optional OpenTelemetry export
//!
//! Console output always goes through `tracing-subscriber`'s fmt layer. When
//! tracing is enabled, spans are additionally exported to an OTLP collector
//! (e.g., Jaeger, Tempo).

use anyhow::{Context, Result};
use config::TracingConfig;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Must be called inside a Tokio
/// runtime context when tracing export is enabled. The returned provider has
/// to be kept alive for as long as spans should be exported.
pub fn init(level: &str, config: &TracingConfig) -> Result<Option<SdkTracerProvider>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {:?}", level))?;

    let provider = if config.enabled {
        build_provider(config)
    } else {
        None
    };
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(otel_layer)
        .try_init()
        .context("Failed to set tracing subscriber")?;

    if provider.is_some() {
        info!(
            endpoint = %config.otlp_endpoint,
            service = %config.service_name,
            sampling_ratio = config.sampling_ratio,
            "OpenTelemetry tracing initialized"
        );
    }
    Ok(provider)
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

fn build_provider(config: &TracingConfig) -> Option<SdkTracerProvider> {
    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(sampler(config.sampling_ratio))
        .with_resource(Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]));

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&config.otlp_endpoint),
        )
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
    {
        Ok(provider) => Some(provider),
        Err(e) => {
            // Subscriber is not installed yet
            eprintln!("Failed to create OTLP tracer provider: {}", e);
            None
        }
    }
}

/// Flush pending spans
pub fn shutdown(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        info!("Shutting down OpenTelemetry tracing");
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }
}
