//! Helper functions for initializing tracing and log collection.
use anyhow::Result;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing for a kubeload process.
///
/// Logs always go to stdout through the fmt layer, filtered by `RUST_LOG`
/// (default `info`). When `otlp_endpoint` is set, spans are additionally
/// exported over OTLP.
pub fn init_tracing(otlp_endpoint: Option<String>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    if let Some(otlp_endpoint) = otlp_endpoint {
        let logger = tracing_subscriber::fmt::layer().with_ansi(false).compact();
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(trace::config().with_resource(Resource::new(vec![
                opentelemetry::KeyValue::new("service.name", "kubeload"),
                opentelemetry::KeyValue::new(
                    "hostname",
                    gethostname::gethostname()
                        .into_string()
                        .expect("hostname should be valid utf-8"),
                ),
            ])))
            .install_batch(runtime::Tokio)?;

        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
        let collector = Registry::default()
            .with(telemetry)
            .with(logger)
            .with(env_filter);
        tracing::subscriber::set_global_default(collector)?;
    } else {
        let logger = tracing_subscriber::fmt::layer().with_ansi(false).compact();
        let collector = Registry::default().with(logger).with(env_filter);
        tracing::subscriber::set_global_default(collector)?;
    }
    Ok(())
}

/// Flush any pending trace exports before the process exits.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
