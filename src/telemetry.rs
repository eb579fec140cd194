//! OpenTelemetry trace export
//!
//! Spans recorded through `tracing` are shipped to an OTLP collector when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

const SERVICE_NAME: &str = "talos-bootstrap";

/// Build the OpenTelemetry layer for `subscriber`
///
/// Returns `None` when no collector endpoint is configured or the exporter
/// cannot be installed; logging keeps working either way.
pub fn init_telemetry<S>(_subscriber: &S) -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            // the subscriber is not installed yet
            eprintln!("failed to install OTLP exporter: {e}");
            None
        }
    }
}

/// Flush pending spans before exit
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_endpoint() {
        if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_err() {
            assert!(init_telemetry(&tracing_subscriber::registry()).is_none());
        }
    }
}
