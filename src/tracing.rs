//! Structured logging and optional OpenTelemetry export
//!
//! Every audit request runs inside an `audit_request` span carrying its
//! `trace_id`; stages, role calls, sandbox runs and bridge connections open
//! child spans. With an OTLP endpoint configured the spans are exported too:
//!
//! ```text
//! civic-audit → OTLP (gRPC) → OTel Collector → Tempo (traces)
//!                                            → Loki (logs)
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;

/// Filter used when neither `RUST_LOG` nor the config sets one
const DEFAULT_FILTER: &str = "info,civic_audit=debug";

/// Initialize the tracing subsystem
///
/// Sets up console logging (plain or JSON) and, when
/// `telemetry.otlp_endpoint` is set, an OpenTelemetry export layer.
///
/// # Example
/// ```ignore
/// init_tracing("civic-audit", &config.telemetry)?;
/// ```
pub fn init_tracing(
    service_name: &str,
    telemetry: &TelemetryConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(telemetry.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let json_layer = telemetry
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let plain_layer = (!telemetry.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let otel_layer = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = build_tracer(service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service = service_name,
        otlp = telemetry.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "Tracing initialized"
    );

    Ok(())
}

/// Build a batching OTLP tracer for `service_name`
fn build_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<sdktrace::Tracer, Box<dyn std::error::Error + Send + Sync>> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
