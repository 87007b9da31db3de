use crate::config::LogFormat;
use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `level`. Spans are
/// exported to Jaeger only when an endpoint is given.
pub fn init(
    level: &str,
    format: LogFormat,
    jaeger_endpoint: Option<&str>,
) -> anyhow::Result<()> {
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let telemetry = match jaeger_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("thumbq")
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (json, pretty) = match format {
        LogFormat::Json => (
            Some(fmt::layer().json().with_current_span(true)),
            None,
        ),
        LogFormat::Pretty => (None, Some(fmt::layer().pretty())),
    };

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(json)
        .with(pretty)
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
